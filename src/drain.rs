use std::time::Instant;

use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{Store, TxOp};

/// Atomically remove and return up to `count` items from the head of the
/// list at `key`, oldest first.
///
/// Uses the store's pop-with-count when it has one. If the store rejects
/// that command, the same effect comes from one transaction reading the
/// first `count` items and trimming them off. Connectivity errors are
/// returned as-is and never trigger the fallback.
pub async fn pop_count<S: Store + ?Sized>(store: &S, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let start = Instant::now();
    let items = if store.capabilities().native_pop_count {
        match store.pop_count_native(key, count).await {
            Ok(reply) => reply.into_items(),
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                warn!(key = %key, error = %e, "native pop rejected, using transaction");
                metrics::counter!("kvsync_pop_fallback_total").increment(1);
                pop_count_tx(store, key, count).await?
            }
        }
    } else {
        pop_count_tx(store, key, count).await?
    };
    metrics::histogram!("kvsync_operation_duration_seconds", "operation" => "pop_count")
        .record(start.elapsed().as_secs_f64());
    debug!(key = %key, count, popped = items.len(), "pop_count");
    Ok(items)
}

async fn pop_count_tx<S: Store + ?Sized>(store: &S, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
    let n = i64::try_from(count).unwrap_or(i64::MAX);
    let replies = store
        .transaction(&[
            TxOp::LRange { key: key.to_owned(), start: 0, stop: n - 1 },
            TxOp::LTrim { key: key.to_owned(), start: n, stop: -1 },
        ])
        .await?;
    Ok(replies.into_iter().next().map(|r| r.into_values()).unwrap_or_default())
}
