use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Opaque 128-bit identifier handed out by a persistence strategy on `store`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// The all-zero identifier. Never handed out by a generator and rejected by queues.
    pub const NIL: ObjectId = ObjectId(Uuid::nil());

    pub const LEN: usize = 16;

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Parse the hyphenated form produced by `Display` (used for record file names)
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl From<Uuid> for ObjectId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Source of fresh identifiers, injected into every persistence strategy
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> ObjectId;
}

/// Random (v4) UUID identifiers
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> ObjectId {
        loop {
            let id = ObjectId(Uuid::new_v4());
            if !id.is_nil() {
                return id;
            }
        }
    }
}

/// Deterministic identifiers: `start`, `start + 1`, ...
///
/// Two generators created with the same start produce the same sequence,
/// which keeps tests reproducible.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> ObjectId {
        ObjectId::from_u128(self.next.fetch_add(1, Ordering::SeqCst) as u128)
    }
}

/// User payload carried through a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Raw bytes
    Bytes(Vec<u8>),
    /// UTF-8 text
    Text(String),
    /// Structured value, persisted as JSON
    Object(serde_json::Value),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Bytes(value.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Object(value)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Payload::Text(s) => write!(f, "{s}"),
            Payload::Object(v) => write!(f, "{v}"),
        }
    }
}
