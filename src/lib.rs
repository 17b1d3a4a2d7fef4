pub mod bulk;
pub mod client;
pub mod codec;
pub mod config;
pub mod drain;
pub mod error;
pub mod glob;
pub mod keys;
pub mod lock;
pub mod pager;
pub mod resp;
pub mod scan;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::Client;
pub use config::{CapabilityMode, Config};
pub use error::{Error, Result};
pub use keys::KeyError;
pub use lock::{BackoffRange, LockOptions, LockRecord};
pub use pager::{ListPager, PageMode};
pub use scan::ScanPages;
pub use store::{Capabilities, Cursor, MemoryStore, PopReply, RespStore, Store, TxOp, TxReply};
