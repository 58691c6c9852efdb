//! Dynamically-typed values
//!
//! [`Value`] is the exchange currency between an embedding runtime and the
//! cross-thread transport: nil, booleans, numbers, binary-safe strings and
//! shared resource handles. Handles compare by identity, not contents: two
//! values are the same handle when they share one underlying resource.

use crate::file::File;
use crate::queue::Queue;
use crate::socket::Socket;

/// A shared resource travelling as a value.
#[derive(Debug, Clone)]
pub enum Handle {
    File(File),
    Socket(Socket),
    Queue(Queue),
}

impl Handle {
    pub fn same_as(&self, other: &Handle) -> bool {
        match (self, other) {
            (Handle::File(a), Handle::File(b)) => a.same_as(b),
            (Handle::Socket(a), Handle::Socket(b)) => a.token() == b.token(),
            (Handle::Queue(a), Handle::Queue(b)) => a.same_as(b),
            _ => false,
        }
    }
}

/// One dynamically-typed value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Str(Vec<u8>),
    Handle(Handle),
}

impl Value {
    pub fn string(s: impl Into<Vec<u8>>) -> Value {
        Value::Str(s.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Handle(a), Value::Handle(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.as_bytes().to_vec())
    }
}

impl From<File> for Value {
    fn from(v: File) -> Value {
        Value::Handle(Handle::File(v))
    }
}

impl From<Socket> for Value {
    fn from(v: Socket) -> Value {
        Value::Handle(Handle::Socket(v))
    }
}

impl From<Queue> for Value {
    fn from(v: Queue) -> Value {
        Value::Handle(Handle::Queue(v))
    }
}
