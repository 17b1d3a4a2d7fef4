use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::{Capabilities, Cursor, PopReply, Store, TxOp, TxReply};
use crate::error::{Error, Result};
use crate::glob::glob_match;

pub const DEFAULT_MEMORY_LIMIT: usize = 1_073_741_824; // 1 GiB

const WRONGTYPE: &str = "Operation against a key holding the wrong kind of value";

/// Prefix that keeps memory cursors distinct from the `"0"` sentinel.
const CURSOR_PREFIX: char = '>';

pub(crate) enum Value {
    String(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

impl Value {
    fn byte_len(&self) -> usize {
        match self {
            Value::String(b) => b.len(),
            Value::List(items) => items.iter().map(|b| b.len()).sum(),
        }
    }
}

pub(crate) struct Entry {
    value: Value,
    expiry: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expiry: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|e| now >= e)
    }
}

/// Resolve Redis-style inclusive `[start, stop]` (negatives count from the
/// tail) against `len`. `None` when the range selects nothing.
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let start = if start < 0 { (start + len).max(0) } else { start };
    let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

struct Db {
    entries: BTreeMap<String, Entry>,
    used_bytes: usize,
    memory_limit: usize,
}

impl Db {
    fn new(memory_limit: usize) -> Self {
        metrics::gauge!("kvsync_memory_limit_bytes").set(memory_limit as f64);
        Self {
            entries: BTreeMap::new(),
            used_bytes: 0,
            memory_limit,
        }
    }

    fn entry_size(key: &str, value_byte_len: usize) -> usize {
        key.len() + value_byte_len
    }

    fn record(&self) {
        metrics::gauge!("kvsync_memory_keys_total").set(self.entries.len() as f64);
        metrics::gauge!("kvsync_memory_used_bytes").set(self.used_bytes as f64);
    }

    /// Drop `key` if its TTL has passed.
    fn purge_expired(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            debug!(key = %key, "expiring key");
            self.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_expired(key);
        self.entries.get_mut(key)
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let removed = self.entries.remove(key);
        if let Some(ref e) = removed {
            let size = Self::entry_size(key, e.value.byte_len());
            self.used_bytes = self.used_bytes.saturating_sub(size);
            self.record();
        }
        removed
    }

    fn put(&mut self, key: &str, entry: Entry) -> Result<()> {
        self.purge_expired(key);
        let new_size = Self::entry_size(key, entry.value.byte_len());
        let old_size = self
            .entries
            .get(key)
            .map(|e| Self::entry_size(key, e.value.byte_len()))
            .unwrap_or(0);
        let net_delta = new_size.saturating_sub(old_size);
        if self.used_bytes.saturating_add(net_delta) > self.memory_limit {
            return Err(Error::OutOfMemory);
        }
        self.used_bytes = self.used_bytes.saturating_sub(old_size).saturating_add(new_size);
        self.entries.insert(key.to_owned(), entry);
        self.record();
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::String(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::List(_)) => Err(Error::WrongType(WRONGTYPE.to_owned())),
        }
    }

    fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<Vec<u8>>>> {
        match self.live(key).map(|e| &mut e.value) {
            None => Ok(None),
            Some(Value::List(items)) => Ok(Some(items)),
            Some(Value::String(_)) => Err(Error::WrongType(WRONGTYPE.to_owned())),
        }
    }

    fn llen(&mut self, key: &str) -> Result<u64> {
        Ok(self.list(key)?.map(|l| l.len() as u64).unwrap_or(0))
    }

    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let Some(list) = self.list(key)? else {
            return Ok(Vec::new());
        };
        Ok(match normalize_range(start, stop, list.len()) {
            None => Vec::new(),
            Some((from, to)) => list.range(from..=to).cloned().collect(),
        })
    }

    fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> Result<()> {
        let Some(list) = self.list(key)? else {
            return Ok(());
        };
        let before: usize = list.iter().map(|b| b.len()).sum();
        match normalize_range(start, stop, list.len()) {
            None => list.clear(),
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
            }
        }
        let after: usize = list.iter().map(|b| b.len()).sum();
        let now_empty = list.is_empty();
        self.used_bytes = self.used_bytes.saturating_sub(before - after);
        if now_empty {
            self.remove(key);
        } else {
            self.record();
        }
        Ok(())
    }

    fn rpush(&mut self, key: &str, values: &[Vec<u8>]) -> Result<u64> {
        let added: usize = values.iter().map(|v| v.len()).sum();
        let is_new = self.list(key)?.is_none();
        let delta = added + if is_new { key.len() } else { 0 };
        if self.used_bytes.saturating_add(delta) > self.memory_limit {
            return Err(Error::OutOfMemory);
        }
        let entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new()), None));
        let Value::List(list) = &mut entry.value else {
            return Err(Error::WrongType(WRONGTYPE.to_owned()));
        };
        list.extend(values.iter().cloned());
        let len = list.len() as u64;
        self.used_bytes += delta;
        self.record();
        Ok(len)
    }

    fn pop_front(&mut self, key: &str, count: usize) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(list) = self.list(key)? else {
            return Ok(None);
        };
        let take = count.min(list.len());
        let popped: Vec<Vec<u8>> = list.drain(..take).collect();
        let now_empty = list.is_empty();
        let freed: usize = popped.iter().map(|b| b.len()).sum();
        self.used_bytes = self.used_bytes.saturating_sub(freed);
        if now_empty {
            self.remove(key);
        } else {
            self.record();
        }
        Ok(Some(popped))
    }

    fn del(&mut self, keys: &[String]) -> u64 {
        let mut removed = 0;
        for key in keys {
            self.purge_expired(key);
            if self.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    fn apply(&mut self, op: &TxOp) -> Result<TxReply> {
        match op {
            TxOp::Get { key } => self.get(key).map(TxReply::Value),
            TxOp::LRange { key, start, stop } => self.lrange(key, *start, *stop).map(TxReply::Values),
            TxOp::LTrim { key, start, stop } => self.ltrim(key, *start, *stop).map(|()| TxReply::Ok),
            TxOp::RPush { key, values } => self.rpush(key, values).map(|n| TxReply::Integer(n as i64)),
            TxOp::Del { keys } => Ok(TxReply::Integer(self.del(keys) as i64)),
        }
    }
}

/// In-process store. Every method, and each transaction as a whole, runs
/// under one `RwLock` and is atomic.
pub struct MemoryStore {
    db: RwLock<Db>,
    caps: Capabilities,
    scan_overlap: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store with every optional command available.
    pub fn new() -> Self {
        Self::with_memory_limit(DEFAULT_MEMORY_LIMIT)
    }

    pub fn with_memory_limit(memory_limit: usize) -> Self {
        Self {
            db: RwLock::new(Db::new(memory_limit)),
            caps: Capabilities::ALL,
            scan_overlap: 0,
        }
    }

    /// Emulate an older server by switching optional commands off. Disabled
    /// commands are rejected the way such a server rejects them.
    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Re-emit the last `n` keys of each page at the start of the next one,
    /// the way a rehashing server revisits buckets mid-scan.
    pub fn with_scan_overlap(mut self, n: usize) -> Self {
        self.scan_overlap = n;
        self
    }

    pub async fn used_bytes(&self) -> usize {
        self.db.read().await.used_bytes
    }

    pub async fn key_count(&self) -> usize {
        self.db.read().await.entries.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn scan(&self, cursor: &Cursor, pattern: &str, page_hint: usize) -> Result<(Cursor, Vec<String>)> {
        let mut db = self.db.write().await;
        let now = Instant::now();
        let page_hint = page_hint.max(1);
        let overlap = self.scan_overlap.min(page_hint - 1);

        let lower = match cursor.as_str().strip_prefix(CURSOR_PREFIX) {
            None => Bound::Unbounded,
            Some(last) => {
                let rewind = db
                    .entries
                    .range::<str, _>((Bound::Unbounded, Bound::Included(last)))
                    .rev()
                    .take(overlap)
                    .last()
                    .map(|(k, _)| k.clone());
                match rewind {
                    Some(first) => Bound::Included(first),
                    None => Bound::Excluded(last.to_owned()),
                }
            }
        };

        let mut keys = Vec::new();
        let mut expired = Vec::new();
        let mut last_examined = None;
        let mut examined = 0;
        let mut exhausted = true;
        for (key, entry) in db.entries.range::<String, _>((lower, Bound::Unbounded)) {
            if examined == page_hint {
                exhausted = false;
                break;
            }
            examined += 1;
            last_examined = Some(key.clone());
            if entry.is_expired(now) {
                expired.push(key.clone());
            } else if glob_match(pattern.as_bytes(), key.as_bytes()) {
                keys.push(key.clone());
            }
        }
        for key in &expired {
            db.remove(key);
        }

        let next = match (exhausted, last_examined) {
            (false, Some(last)) => Cursor::new(format!("{CURSOR_PREFIX}{last}")),
            _ => Cursor::START,
        };
        debug!(cursor = %cursor, next = %next, pattern, found = keys.len(), "SCAN");
        Ok((next, keys))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.write().await.get(key)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut db = self.db.write().await;
        // Non-string values read as absent, like MGET.
        Ok(keys.iter().map(|k| db.get(k).ok().flatten()).collect())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        debug!(key = %key, ttl = ?ttl, "SET");
        self.db
            .write()
            .await
            .put(key, Entry::new(Value::String(value.to_vec()), ttl))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut db = self.db.write().await;
        Ok(match db.live(key) {
            None => false,
            Some(entry) => {
                entry.expiry = Some(Instant::now() + ttl);
                true
            }
        })
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        self.db.write().await.llen(key)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        self.db.write().await.lrange(key, start, stop)
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64> {
        self.db.write().await.rpush(key, values)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.db.write().await.ltrim(key, start, stop)
    }

    async fn pop_count_native(&self, key: &str, count: usize) -> Result<PopReply> {
        if !self.caps.native_pop_count {
            return Err(Error::Server(
                "ERR wrong number of arguments for 'lpop' command".to_owned(),
            ));
        }
        let popped = self.db.write().await.pop_front(key, count)?;
        debug!(key = %key, count, popped = popped.as_ref().map(Vec::len), "LPOP");
        Ok(match popped {
            Some(items) if !items.is_empty() => PopReply::Many(items),
            _ => PopReply::Nil,
        })
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        Ok(self.db.write().await.del(keys))
    }

    async fn unlink(&self, keys: &[String]) -> Result<u64> {
        if !self.caps.unlink {
            return Err(Error::Server("ERR unknown command 'UNLINK'".to_owned()));
        }
        Ok(self.db.write().await.del(keys))
    }

    async fn set_if_absent_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut db = self.db.write().await;
        if db.live(key).is_some() {
            return Ok(false);
        }
        db.put(key, Entry::new(Value::String(value.to_vec()), Some(ttl)))?;
        debug!(key = %key, ttl = ?ttl, "SET NX");
        Ok(true)
    }

    async fn transaction(&self, ops: &[TxOp]) -> Result<Vec<TxReply>> {
        let mut db = self.db.write().await;
        let mut replies = Vec::with_capacity(ops.len());
        let mut first_err = None;
        // Like EXEC: a failing op does not stop the ones queued after it.
        for op in ops {
            match db.apply(op) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(replies),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut db = self.db.write().await;
        match db.get(key)? {
            Some(current) if current == expected => {
                db.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
