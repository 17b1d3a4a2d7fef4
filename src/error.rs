use thiserror::Error;

use crate::keys::KeyError;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure talking to the store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Strict-connection mode and the connection is gone.
    #[error("not connected to store at {addr}")]
    NotConnected { addr: String },

    /// The store sent something that is not a valid reply for the command.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("WRONGTYPE {0}")]
    WrongType(String),

    /// Any other error reply from the store, verbatim.
    #[error("store error: {0}")]
    Server(String),

    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,

    /// The store discarded a queued transaction (`EXEC` returned nil).
    #[error("transaction aborted by store")]
    TransactionAborted,

    /// A bulk delete failed somewhere; how much was removed is unknown.
    #[error("bulk delete of '{pattern}' failed")]
    BulkDelete {
        pattern: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// True for failures that mean the store is unreachable or speaking
    /// garbage. These are never retried or suppressed by the primitives.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::NotConnected { .. } | Error::Protocol(_)
        )
    }

    /// Classify a RESP error line (without the leading `-`).
    pub(crate) fn from_reply(line: &str) -> Self {
        match line.strip_prefix("WRONGTYPE ") {
            Some(rest) => Error::WrongType(rest.to_owned()),
            None if line.starts_with("OOM ") => Error::OutOfMemory,
            None => Error::Server(line.to_owned()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
