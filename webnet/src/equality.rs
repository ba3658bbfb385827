//! 结构相等判断
//!
//! 对任意动态值做递归的深度比较，用于比较包的载荷和测试数据。
//!
//! 比较规则（按优先级）:
//! 1. 任一侧为 `Null`/`Undefined` 时，仅当两侧完全相同才相等
//! 2. 运行时类型不同则不相等
//! 3. 函数和正则只按引用比较
//! 4. 同一引用或原始值相等则相等
//! 5. 长度不同的数组不相等
//! 6. 日期只按引用比较，值相同的两个日期实例不相等
//! 7. 其余复合对象要求键集合相同且对应值递归相等
//!
//! 复合值通过 `Arc` 共享且不可变，无法构造出循环结构，因此不做环检测。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

/// 可调用值
pub type Function = dyn Fn(&[Node]) -> Node + Send + Sync;

/// 动态值
#[derive(Clone)]
pub enum Node {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Arc<Vec<Node>>),
    Object(Arc<BTreeMap<String, Node>>),
    Function(Arc<Function>),
    Pattern(Arc<Regex>),
    Date(Arc<DateTime<Utc>>),
}

/// 动态值的运行时类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Undefined,
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Function,
    Pattern,
    Date,
}

impl Node {
    pub fn array(items: impl IntoIterator<Item = Node>) -> Self {
        Node::Array(Arc::new(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Node)>) -> Self {
        Node::Object(Arc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[Node]) -> Node + Send + Sync + 'static,
    {
        Node::Function(Arc::new(f))
    }

    pub fn pattern(regex: Regex) -> Self {
        Node::Pattern(Arc::new(regex))
    }

    pub fn date(instant: DateTime<Utc>) -> Self {
        Node::Date(Arc::new(instant))
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Undefined => NodeKind::Undefined,
            Node::Null => NodeKind::Null,
            Node::Bool(_) => NodeKind::Bool,
            Node::Number(_) => NodeKind::Number,
            Node::String(_) => NodeKind::String,
            Node::Array(_) => NodeKind::Array,
            Node::Object(_) => NodeKind::Object,
            Node::Function(_) => NodeKind::Function,
            Node::Pattern(_) => NodeKind::Pattern,
            Node::Date(_) => NodeKind::Date,
        }
    }

    fn is_nullish(&self) -> bool {
        matches!(self, Node::Null | Node::Undefined)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Undefined => write!(f, "Undefined"),
            Node::Null => write!(f, "Null"),
            Node::Bool(b) => write!(f, "Bool({b})"),
            Node::Number(n) => write!(f, "Number({n})"),
            Node::String(s) => write!(f, "String({s:?})"),
            Node::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Node::Object(map) => f.debug_map().entries(map.iter()).finish(),
            Node::Function(func) => write!(f, "Function({:p})", Arc::as_ptr(func).cast::<()>()),
            Node::Pattern(re) => write!(f, "Pattern(/{}/)", re.as_str()),
            Node::Date(instant) => write!(f, "Date({})", instant.to_rfc3339()),
        }
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(b),
            Value::Number(n) => Node::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Node::String(s),
            Value::Array(items) => Node::array(items.into_iter().map(Node::from)),
            Value::Object(map) => Node::object(map.into_iter().map(|(k, v)| (k, Node::from(v)))),
        }
    }
}

impl From<&Value> for Node {
    fn from(value: &Value) -> Self {
        Node::from(value.clone())
    }
}

/// 递归判断两个动态值是否结构相等
pub fn equals(x: &Node, y: &Node) -> bool {
    if x.is_nullish() || y.is_nullish() {
        return x.kind() == y.kind();
    }
    if x.kind() != y.kind() {
        return false;
    }

    match (x, y) {
        (Node::Function(a), Node::Function(b)) => same_ref(a, b),
        (Node::Pattern(a), Node::Pattern(b)) => Arc::ptr_eq(a, b),
        (Node::Bool(a), Node::Bool(b)) => a == b,
        (Node::Number(a), Node::Number(b)) => a == b,
        (Node::String(a), Node::String(b)) => a == b,
        (Node::Date(a), Node::Date(b)) => Arc::ptr_eq(a, b),
        (Node::Array(a), Node::Array(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(l, r)| equals(l, r))
        }
        (Node::Object(a), Node::Object(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            b.keys().all(|k| a.contains_key(k))
                && a.iter()
                    .all(|(k, l)| b.get(k).is_some_and(|r| equals(l, r)))
        }
        _ => false,
    }
}

/// 比较两个 JSON 值，载荷比较的便捷入口
pub fn json_equals(x: &Value, y: &Value) -> bool {
    equals(&Node::from(x), &Node::from(y))
}

fn same_ref(a: &Arc<Function>, b: &Arc<Function>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}
