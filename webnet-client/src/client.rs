//! 命令行客户端核心实现

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::Local;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use webnet::{
    callback, Callback, Connection, ConnectionListener, Outbox, Protocol, ProtocolHandler,
    ReadyState, Service, TransportConfig, WsConnector,
};

/// 打印收到的包
fn printer() -> Callback {
    callback(|data, name| {
        println!("[{}] {} {}", Local::now().format("%H:%M:%S"), name, data);
    })
}

/// 为服务创建同名推送包的回调表
fn build_service(name: &str, protocol: &Protocol) -> webnet::Result<Service> {
    Service::new(name, protocol, [(name, Some(printer()))])
}

/// 取出已订阅过的服务，首次订阅时创建并注册回调
fn ensure_service<'a>(
    services: &'a mut HashMap<String, Service>,
    protocol: &Protocol,
    handler: &ProtocolHandler,
    name: &str,
) -> webnet::Result<&'a Service> {
    match services.entry(name.to_string()) {
        Entry::Occupied(entry) => Ok(&*entry.into_mut()),
        Entry::Vacant(entry) => {
            let service = build_service(name, protocol)?;
            service.register_into(handler)?;
            Ok(&*entry.insert(service))
        }
    }
}

/// 连接生命周期监听器，连接建立后订阅启动时指定的服务
struct ClientListener {
    services: Vec<Service>,
}

impl ConnectionListener for ClientListener {
    fn on_ready_state_change(&mut self, state: ReadyState) -> anyhow::Result<()> {
        debug!("Ready state changed to {}", state);
        Ok(())
    }

    fn on_open(&mut self, outbox: &Outbox<'_>) -> anyhow::Result<()> {
        println!("* connected");
        for service in &self.services {
            if !service.subscribe(outbox) {
                anyhow::bail!("failed to subscribe to {}", service.name());
            }
            info!("Subscribed to {}", service.name());
        }
        Ok(())
    }

    fn on_close(&mut self, code: Option<u16>, reason: &str) -> anyhow::Result<()> {
        match code {
            Some(code) => println!("* disconnected ({}: {})", code, reason),
            None => println!("* disconnected"),
        }
        Ok(())
    }

    fn on_error(&mut self, message: &str) -> anyhow::Result<()> {
        println!("* error: {}", message);
        Ok(())
    }
}

/// 用户输入的命令
#[derive(Debug, PartialEq)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Send { name: String, data: Value },
    Connect,
    Disconnect,
    State,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        let command = match verb {
            "sub" | "subscribe" => Command::Subscribe(required(rest, "service")?),
            "unsub" | "unsubscribe" => Command::Unsubscribe(required(rest, "service")?),
            "send" => {
                let (name, data) = rest.split_once(' ').unwrap_or((rest, ""));
                let data = if data.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(data).map_err(|e| format!("invalid json: {}", e))?
                };
                Command::Send {
                    name: required(name, "packet name")?,
                    data,
                }
            }
            "connect" => Command::Connect,
            "disconnect" => Command::Disconnect,
            "state" => Command::State,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command: {}", other)),
        };
        Ok(Some(command))
    }
}

fn required(value: &str, what: &str) -> Result<String, String> {
    if value.is_empty() {
        Err(format!("missing {}", what))
    } else {
        Ok(value.to_string())
    }
}

const HELP: &str = "\
commands:
  sub <service>          subscribe to a service
  unsub <service>        unsubscribe from a service
  send <packet> [json]   send a packet
  connect | disconnect   open or close the connection
  state                  show the ready state
  quit";

/// 命令行客户端
pub struct Client {
    protocol: Protocol,
    conn: Connection<WsConnector>,
    /// 运行时订阅的服务
    services: HashMap<String, Service>,
}

impl Client {
    /// 创建客户端，`services` 在每次连接建立后自动订阅
    pub fn new(url: &str, services: &[String], config: TransportConfig) -> anyhow::Result<Self> {
        let protocol = Protocol::net();
        let handler = ProtocolHandler::new(protocol.clone());

        let mut initial = Vec::with_capacity(services.len());
        for name in services {
            let service = build_service(name, &protocol)?;
            service.register_into(&handler)?;
            initial.push(service);
        }

        let conn = Connection::websocket(url, handler, config)?
            .with_listener(ClientListener { services: initial });

        Ok(Self {
            protocol,
            conn,
            services: HashMap::new(),
        })
    }

    /// 连接并处理事件和标准输入，直到 quit、EOF 或 Ctrl+C
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!("Connecting to {}", self.conn.url());
        self.conn.connect()?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                result = self.conn.process_next() => {
                    if let Err(e) = result {
                        warn!("Failed to handle inbound frame: {}", e);
                    }
                }

                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    match Command::parse(&line) {
                        Ok(Some(command)) => {
                            if !self.execute(command) {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => println!("* {}", e),
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        self.conn.disconnect();
        Ok(())
    }

    /// 执行命令，返回 false 表示退出；命令出错只打印，不结束会话
    fn execute(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe(name) => {
                match ensure_service(&mut self.services, &self.protocol, self.conn.handler(), &name)
                {
                    Ok(service) => report(service.subscribe(&self.conn), "subscribe", &name),
                    Err(e) => println!("* {}", e),
                }
            }
            Command::Unsubscribe(name) => match self.services.get(&name) {
                Some(service) => report(service.unsubscribe(&self.conn), "unsubscribe", &name),
                None => println!("* not subscribed to {}", name),
            },
            Command::Send { name, data } => match self.protocol.packet(&name, data) {
                Ok(packet) => report(self.conn.send(packet), "send", &name),
                Err(e) => println!("* {}", e),
            },
            Command::Connect => {
                if let Err(e) = self.conn.connect() {
                    println!("* {}", e);
                }
            }
            Command::Disconnect => self.conn.disconnect(),
            Command::State => println!("* {}", self.conn.state()),
            Command::Help => println!("{}", HELP),
            Command::Quit => return false,
        }
        true
    }
}

fn report(sent: bool, action: &str, name: &str) {
    if sent {
        debug!("{} {} sent", action, name);
    } else {
        println!("* {} {} not sent, connection is not open", action, name);
    }
}
