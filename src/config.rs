use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_SCAN_PAGE_HINT: usize = 100;
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_LOCK_RETRIES: u32 = 10;
pub const DEFAULT_LOCK_BACKOFF_MIN_MS: u64 = 50;
pub const DEFAULT_LOCK_BACKOFF_MAX_MS: u64 = 250;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_RESP_ARGS: usize = 1024 * 1024;
pub const DEFAULT_MAX_RESP_BULK_LEN: usize = 512 * 1024 * 1024; // 512 MiB
pub const DEFAULT_MAX_RESP_INLINE_LEN: usize = 64 * 1024;

/// How an optional store command is chosen: negotiated, or forced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CapabilityMode {
    #[default]
    Auto,
    On,
    Off,
}

impl CapabilityMode {
    fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(CapabilityMode::Auto),
            "on" | "true" | "1" => Some(CapabilityMode::On),
            "off" | "false" | "0" => Some(CapabilityMode::Off),
            _ => None,
        }
    }

    /// Resolve against what negotiation found.
    pub fn resolve(self, negotiated: bool) -> bool {
        match self {
            CapabilityMode::Auto => negotiated,
            CapabilityMode::On => true,
            CapabilityMode::Off => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Fail with `NotConnected` after a dropped connection instead of reconnecting.
    pub strict_connection: bool,
    pub connect_timeout_ms: u64,
    pub scan_page_hint: usize,
    pub chunk_size: usize,
    pub lock_retries: u32,
    pub lock_backoff_min_ms: u64,
    pub lock_backoff_max_ms: u64,
    pub native_pop: CapabilityMode,
    pub unlink: CapabilityMode,
    pub max_resp_args: usize,
    pub max_resp_bulk_len: usize,
    pub max_resp_inline_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            strict_connection: false,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            scan_page_hint: DEFAULT_SCAN_PAGE_HINT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            lock_retries: DEFAULT_LOCK_RETRIES,
            lock_backoff_min_ms: DEFAULT_LOCK_BACKOFF_MIN_MS,
            lock_backoff_max_ms: DEFAULT_LOCK_BACKOFF_MAX_MS,
            native_pop: CapabilityMode::Auto,
            unlink: CapabilityMode::Auto,
            max_resp_args: DEFAULT_MAX_RESP_ARGS,
            max_resp_bulk_len: DEFAULT_MAX_RESP_BULK_LEN,
            max_resp_inline_len: DEFAULT_MAX_RESP_INLINE_LEN,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a count that must be at least 1.
fn parse_positive(s: &str) -> Option<usize> {
    s.parse::<usize>().ok().filter(|&n| n > 0)
}

impl Config {
    /// Build a config from `KVSYNC_*` environment variables. Call this once at
    /// startup and hand the result to the store and client; nothing in the
    /// crate reads the environment by itself.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self::from_vars(
            var("KVSYNC_HOST").as_deref(),
            var("KVSYNC_PORT").as_deref(),
            var("KVSYNC_STRICT").as_deref(),
            var("KVSYNC_CONNECT_TIMEOUT_MS").as_deref(),
            var("KVSYNC_SCAN_PAGE_HINT").as_deref(),
            var("KVSYNC_CHUNK_SIZE").as_deref(),
            var("KVSYNC_LOCK_RETRIES").as_deref(),
            var("KVSYNC_LOCK_BACKOFF_MIN_MS").as_deref(),
            var("KVSYNC_LOCK_BACKOFF_MAX_MS").as_deref(),
            var("KVSYNC_NATIVE_POP").as_deref(),
            var("KVSYNC_UNLINK").as_deref(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn from_vars(
        host: Option<&str>,
        port: Option<&str>,
        strict: Option<&str>,
        connect_timeout_ms: Option<&str>,
        scan_page_hint: Option<&str>,
        chunk_size: Option<&str>,
        lock_retries: Option<&str>,
        lock_backoff_min_ms: Option<&str>,
        lock_backoff_max_ms: Option<&str>,
        native_pop: Option<&str>,
        unlink: Option<&str>,
    ) -> Self {
        let defaults = Self::default();
        let backoff_min = lock_backoff_min_ms
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.lock_backoff_min_ms);
        let backoff_max = lock_backoff_max_ms
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.lock_backoff_max_ms)
            .max(backoff_min);
        Self {
            host: host.map(|s| s.to_string()).unwrap_or(defaults.host),
            port: port.and_then(|s| s.parse().ok()).unwrap_or(defaults.port),
            strict_connection: strict
                .and_then(parse_bool)
                .unwrap_or(defaults.strict_connection),
            connect_timeout_ms: connect_timeout_ms
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.connect_timeout_ms),
            scan_page_hint: scan_page_hint
                .and_then(parse_positive)
                .unwrap_or(defaults.scan_page_hint),
            chunk_size: chunk_size
                .and_then(parse_positive)
                .unwrap_or(defaults.chunk_size),
            lock_retries: lock_retries
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.lock_retries),
            lock_backoff_min_ms: backoff_min,
            lock_backoff_max_ms: backoff_max,
            native_pop: native_pop
                .and_then(CapabilityMode::from_str)
                .unwrap_or(defaults.native_pop),
            unlink: unlink
                .and_then(CapabilityMode::from_str)
                .unwrap_or(defaults.unlink),
            ..defaults
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn lock_backoff(&self) -> crate::lock::BackoffRange {
        crate::lock::BackoffRange::new(
            Duration::from_millis(self.lock_backoff_min_ms),
            Duration::from_millis(self.lock_backoff_max_ms),
        )
    }

    pub fn resp_limits(&self) -> crate::resp::RespLimits {
        crate::resp::RespLimits {
            max_array_len: self.max_resp_args,
            max_bulk_len: self.max_resp_bulk_len,
            max_inline_len: self.max_resp_inline_len,
        }
    }
}
