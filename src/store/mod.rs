use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
pub mod resp;

pub use memory::MemoryStore;
pub use resp::RespStore;

/// Opaque scan progress token. [`Cursor::START`] both starts a traversal and,
/// when handed back by the store, marks it complete.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub const START: Cursor = Cursor(String::new());

    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        if token == "0" { Cursor::START } else { Cursor(token) }
    }

    pub fn is_start(&self) -> bool {
        self.0.is_empty()
    }

    /// Wire form; the sentinel is `"0"`.
    pub fn as_str(&self) -> &str {
        if self.0.is_empty() { "0" } else { &self.0 }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional commands, fixed when the store is constructed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Pop-with-count on the list head in one command.
    pub native_pop_count: bool,
    /// Non-blocking delete.
    pub unlink: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities { native_pop_count: true, unlink: true };
    pub const NONE: Capabilities = Capabilities { native_pop_count: false, unlink: false };
}

/// Reply shapes of the native pop-N command across store versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PopReply {
    Many(Vec<Vec<u8>>),
    Single(Vec<u8>),
    Nil,
}

impl PopReply {
    pub fn into_items(self) -> Vec<Vec<u8>> {
        match self {
            PopReply::Many(items) => items,
            PopReply::Single(item) => vec![item],
            PopReply::Nil => Vec::new(),
        }
    }
}

/// One operation queued inside an atomic transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxOp {
    Get { key: String },
    LRange { key: String, start: i64, stop: i64 },
    LTrim { key: String, start: i64, stop: i64 },
    RPush { key: String, values: Vec<Vec<u8>> },
    Del { keys: Vec<String> },
}

/// Per-op transaction reply, shaped by the op that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxReply {
    Ok,
    Integer(i64),
    Value(Option<Vec<u8>>),
    Values(Vec<Vec<u8>>),
}

impl TxReply {
    pub fn into_values(self) -> Vec<Vec<u8>> {
        match self {
            TxReply::Values(v) => v,
            TxReply::Value(Some(v)) => vec![v],
            TxReply::Value(None) | TxReply::Ok | TxReply::Integer(_) => Vec::new(),
        }
    }
}

/// A shared, remotely mutable key/list store.
///
/// Every method is one round trip. Implementations must make
/// `transaction`, `set_if_absent_with_expiry` and `compare_and_delete`
/// atomic with respect to all other clients.
#[async_trait]
pub trait Store: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn ping(&self) -> Result<()>;

    async fn scan(&self, cursor: &Cursor, pattern: &str, page_hint: usize) -> Result<(Cursor, Vec<String>)>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// One slot per key, `None` where the key is absent.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn llen(&self, key: &str) -> Result<u64>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64>;

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    /// Only called when `capabilities().native_pop_count` is set.
    async fn pop_count_native(&self, key: &str, count: usize) -> Result<PopReply>;

    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Only called when `capabilities().unlink` is set.
    async fn unlink(&self, keys: &[String]) -> Result<u64>;

    /// Returns true if the key was absent and is now set.
    async fn set_if_absent_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Run every op as one indivisible unit; one reply per op, in order.
    async fn transaction(&self, ops: &[TxOp]) -> Result<Vec<TxReply>>;

    /// Delete `key` only if its value equals `expected`. True if deleted.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;
}
