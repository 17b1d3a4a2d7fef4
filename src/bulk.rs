use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::error::{Error, Result};
use crate::scan::{ScanPages, enumerate};
use crate::store::Store;

fn check_chunk(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::InvalidArgument("chunk size must be at least 1"));
    }
    Ok(())
}

/// Fetch `keys` with one multi-get per `chunk_size` keys. Absent keys map to
/// `None`; an empty stored value maps to `Some(vec![])`.
pub async fn read_many<S: Store + ?Sized>(
    store: &S,
    keys: &[String],
    chunk_size: usize,
) -> Result<HashMap<String, Option<Vec<u8>>>> {
    check_chunk(chunk_size)?;
    let start = Instant::now();
    let mut out = HashMap::with_capacity(keys.len());
    for chunk in keys.chunks(chunk_size) {
        let values = store.mget(chunk).await?;
        if values.len() != chunk.len() {
            return Err(Error::Protocol(format!(
                "multi-get returned {} values for {} keys",
                values.len(),
                chunk.len()
            )));
        }
        out.extend(chunk.iter().cloned().zip(values));
    }
    metrics::histogram!("kvsync_operation_duration_seconds", "operation" => "read_many")
        .record(start.elapsed().as_secs_f64());
    debug!(keys = keys.len(), chunks = keys.len().div_ceil(chunk_size), "read_many");
    Ok(out)
}

/// [`enumerate`] then [`read_many`]. Keys deleted between the two steps come
/// back as `None`.
pub async fn read_matching<S: Store + ?Sized>(
    store: &S,
    pattern: &str,
    limit: Option<usize>,
    page_hint: usize,
    chunk_size: usize,
) -> Result<HashMap<String, Option<Vec<u8>>>> {
    check_chunk(chunk_size)?;
    let keys = enumerate(store, pattern, limit, page_hint).await?;
    read_many(store, &keys, chunk_size).await
}

/// Delete every key matching `pattern`, scanning page by page and deleting
/// each page in batches of at most `chunk_size`. Returns how many distinct
/// keys were found, which can exceed how many were actually removed when
/// other clients delete concurrently.
///
/// Any failure aborts with [`Error::BulkDelete`]; what was already removed
/// stays removed.
pub async fn delete_many<S: Store + ?Sized>(
    store: &S,
    pattern: &str,
    page_hint: usize,
    chunk_size: usize,
) -> Result<usize> {
    check_chunk(chunk_size)?;
    let mut pages = ScanPages::new(store, pattern, page_hint)?;
    let start = Instant::now();
    let unlink = store.capabilities().unlink;

    let outcome = async {
        while let Some(page) = pages.next_page().await? {
            for batch in page.chunks(chunk_size) {
                let removed = if unlink {
                    store.unlink(batch).await?
                } else {
                    store.del(batch).await?
                };
                metrics::counter!("kvsync_keys_deleted_total").increment(removed);
            }
        }
        Ok::<(), Error>(())
    }
    .await;

    metrics::histogram!("kvsync_operation_duration_seconds", "operation" => "delete_many")
        .record(start.elapsed().as_secs_f64());
    match outcome {
        Ok(()) => {
            debug!(pattern, matched = pages.seen(), unlink, "delete_many");
            Ok(pages.seen())
        }
        Err(source) => Err(Error::BulkDelete {
            pattern: pattern.to_owned(),
            source: Box::new(source),
        }),
    }
}
