//! 测试用的脚本化传输层

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ProtocolError, Result};
use crate::state::ReadyState;
use crate::transport::{Connector, EventSink, Transport, TransportEventKind};

/// 由测试手动驱动状态的传输实例
#[derive(Debug)]
pub struct MockTransport {
    url: String,
    state: AtomicU8,
    sent: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
}

impl MockTransport {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: AtomicU8::new(ReadyState::Connecting.code()),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: ReadyState) {
        self.state.store(state.code(), Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_code(self.state.load(Ordering::SeqCst)).unwrap_or(ReadyState::Closed)
    }

    fn send(&self, frame: String) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if matches!(
            self.ready_state(),
            ReadyState::Connecting | ReadyState::Open
        ) {
            self.set_state(ReadyState::Closing);
        }
    }
}

type Opened = (Arc<MockTransport>, EventSink<MockTransport>);

/// 记录每次创建的传输实例，克隆后共享记录
#[derive(Clone, Default)]
pub struct MockConnector {
    opened: Arc<Mutex<Vec<Opened>>>,
    fail_next: Arc<AtomicBool>,
}

impl MockConnector {
    pub fn opened(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.opened.lock()[index].0)
    }

    pub fn url(&self, index: usize) -> String {
        self.opened.lock()[index].0.url.clone()
    }

    /// 让下一次 open 失败
    pub fn fail_next_open(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// 通过事件通道上报事件
    pub fn emit(&self, index: usize, kind: TransportEventKind) -> bool {
        let opened = self.opened.lock();
        let (transport, sink) = &opened[index];
        sink.emit(transport, kind)
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn open(&self, url: &str, events: EventSink<MockTransport>) -> Result<Arc<MockTransport>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        let transport = Arc::new(MockTransport::new(url));
        self.opened.lock().push((Arc::clone(&transport), events));
        Ok(transport)
    }
}
