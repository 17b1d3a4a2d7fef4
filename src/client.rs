use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bulk;
use crate::codec;
use crate::config::Config;
use crate::drain;
use crate::error::{Error, Result};
use crate::keys::{validate_exact, validate_pattern};
use crate::lock::{self, LockOptions, LockRecord};
use crate::pager::{ListPager, PageMode};
use crate::scan;
use crate::store::{RespStore, Store};

/// A store plus the sizes, retries and backoff every call should use.
/// Keys and patterns are validated before anything reaches the store.
pub struct Client<S: Store + ?Sized> {
    store: Arc<S>,
    config: Config,
}

impl<S: Store + ?Sized> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl Client<RespStore> {
    pub async fn connect(config: Config) -> Result<Self> {
        let store = RespStore::connect(&config).await?;
        Ok(Self::new(Arc::new(store), config))
    }
}

impl<S: Store + ?Sized> Client<S> {
    pub fn new(store: Arc<S>, config: Config) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            retries: self.config.lock_retries,
            backoff: self.config.lock_backoff(),
        }
    }

    /// Ping until the store answers, at most `attempts` times (at least once),
    /// pausing `interval` between tries. Returns the last error on failure.
    pub async fn wait_ready(&self, attempts: u32, interval: Duration) -> Result<()> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.ping().await {
                Ok(()) => {
                    info!(attempt, "store ready");
                    return Ok(());
                }
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(attempt, error = %e, "store not ready");
                    attempt += 1;
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    // ── Keys ─────────────────────────────────────────────────────────────────

    pub async fn enumerate(&self, pattern: &str, limit: Option<usize>) -> Result<Vec<String>> {
        validate_pattern(pattern)?;
        scan::enumerate(self.store.as_ref(), pattern, limit, self.config.scan_page_hint).await
    }

    pub async fn read_matching(
        &self,
        pattern: &str,
        limit: Option<usize>,
    ) -> Result<HashMap<String, Option<Vec<u8>>>> {
        validate_pattern(pattern)?;
        bulk::read_matching(
            self.store.as_ref(),
            pattern,
            limit,
            self.config.scan_page_hint,
            self.config.chunk_size,
        )
        .await
    }

    /// Decode every matching value as JSON. Keys that vanished between the
    /// scan and the read are left out.
    pub async fn read_matching_json<T: DeserializeOwned>(
        &self,
        pattern: &str,
        limit: Option<usize>,
    ) -> Result<HashMap<String, T>> {
        self.read_matching(pattern, limit)
            .await?
            .into_iter()
            .filter_map(|(key, raw)| raw.map(|bytes| codec::decode(&bytes).map(|v| (key, v))))
            .collect()
    }

    pub async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        validate_pattern(pattern)?;
        bulk::delete_many(
            self.store.as_ref(),
            pattern,
            self.config.scan_page_hint,
            self.config.chunk_size,
        )
        .await
    }

    // ── Lists ────────────────────────────────────────────────────────────────

    pub async fn pop_count(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        validate_exact(key)?;
        drain::pop_count(self.store.as_ref(), key, count).await
    }

    pub fn pages(&self, key: &str, window: usize, mode: PageMode) -> Result<ListPager<'_, S>> {
        validate_exact(key)?;
        ListPager::new(self.store.as_ref(), key, window, mode)
    }

    // ── Locks ────────────────────────────────────────────────────────────────

    pub async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockRecord>> {
        validate_exact(key)?;
        lock::acquire(self.store.as_ref(), key, ttl, &self.lock_options()).await
    }

    pub async fn acquire_lock_until(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<Option<LockRecord>> {
        validate_exact(key)?;
        lock::acquire_until(self.store.as_ref(), key, ttl, &self.lock_options(), deadline).await
    }

    pub async fn release_lock(&self, record: &LockRecord) -> Result<bool> {
        lock::release(self.store.as_ref(), record.key(), record.token()).await
    }

    // ── Single values ────────────────────────────────────────────────────────

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        validate_exact(key)?;
        match self.store.get(key).await? {
            Some(bytes) => codec::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        validate_exact(key)?;
        if ttl.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidArgument("ttl must be positive"));
        }
        let bytes = codec::encode(value)?;
        self.store.set(key, &bytes, ttl).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        validate_exact(key)?;
        if ttl.is_zero() {
            return Err(Error::InvalidArgument("ttl must be positive"));
        }
        self.store.expire(key, ttl).await
    }
}
