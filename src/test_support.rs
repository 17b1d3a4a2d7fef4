use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::store::{Capabilities, Cursor, MemoryStore, PopReply, Store, TxOp, TxReply};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wraps a [`MemoryStore`], recording each call as `(command, batch size)`
/// and optionally failing chosen commands.
pub(crate) struct Recording {
    pub(crate) inner: MemoryStore,
    calls: Mutex<Vec<(&'static str, usize)>>,
    failures: Mutex<HashMap<&'static str, fn() -> Error>>,
}

impl Recording {
    pub(crate) fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn fail_on(&self, command: &'static str, make: fn() -> Error) {
        self.failures.lock().unwrap().insert(command, make);
    }

    pub(crate) fn count(&self, command: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(c, _)| *c == command).count()
    }

    pub(crate) fn sizes(&self, command: &str) -> Vec<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == command)
            .map(|(_, n)| *n)
            .collect()
    }

    pub(crate) fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, command: &'static str, size: usize) -> Result<()> {
        self.calls.lock().unwrap().push((command, size));
        match self.failures.lock().unwrap().get(command) {
            Some(make) => Err(make()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Store for Recording {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn ping(&self) -> Result<()> {
        self.record("ping", 0)?;
        self.inner.ping().await
    }

    async fn scan(&self, cursor: &Cursor, pattern: &str, page_hint: usize) -> Result<(Cursor, Vec<String>)> {
        self.record("scan", page_hint)?;
        self.inner.scan(cursor, pattern, page_hint).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.record("get", 1)?;
        self.inner.get(key).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.record("mget", keys.len())?;
        self.inner.mget(keys).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.record("set", 1)?;
        self.inner.set(key, value, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.record("expire", 1)?;
        self.inner.expire(key, ttl).await
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        self.record("llen", 1)?;
        self.inner.llen(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        self.record("lrange", 1)?;
        self.inner.lrange(key, start, stop).await
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64> {
        self.record("rpush", values.len())?;
        self.inner.rpush(key, values).await
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.record("ltrim", 1)?;
        self.inner.ltrim(key, start, stop).await
    }

    async fn pop_count_native(&self, key: &str, count: usize) -> Result<PopReply> {
        self.record("pop_count_native", count)?;
        self.inner.pop_count_native(key, count).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.record("del", keys.len())?;
        self.inner.del(keys).await
    }

    async fn unlink(&self, keys: &[String]) -> Result<u64> {
        self.record("unlink", keys.len())?;
        self.inner.unlink(keys).await
    }

    async fn set_if_absent_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.record("set_if_absent_with_expiry", 1)?;
        self.inner.set_if_absent_with_expiry(key, value, ttl).await
    }

    async fn transaction(&self, ops: &[TxOp]) -> Result<Vec<TxReply>> {
        self.record("transaction", ops.len())?;
        self.inner.transaction(ops).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.record("compare_and_delete", 1)?;
        self.inner.compare_and_delete(key, expected).await
    }
}
