use std::collections::HashSet;
use std::time::Instant;

use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{Cursor, Store};

/// One full cursor traversal, page by page. A store may return a key on
/// more than one page, so the traversal keeps a seen-set and yields each key
/// once.
pub struct ScanPages<'a, S: Store + ?Sized> {
    store: &'a S,
    pattern: &'a str,
    page_hint: usize,
    cursor: Cursor,
    seen: HashSet<String>,
    done: bool,
}

impl<'a, S: Store + ?Sized> ScanPages<'a, S> {
    pub fn new(store: &'a S, pattern: &'a str, page_hint: usize) -> Result<Self> {
        if page_hint == 0 {
            return Err(Error::InvalidArgument("scan page hint must be at least 1"));
        }
        Ok(Self {
            store,
            pattern,
            page_hint,
            cursor: Cursor::START,
            seen: HashSet::new(),
            done: false,
        })
    }

    /// Keys from the next page that this traversal has not produced before.
    /// A page may come back empty while the scan is still running. Returns
    /// `None` once the cursor has wrapped back to the start.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        if self.done {
            return Ok(None);
        }
        let (next, keys) = self.store.scan(&self.cursor, self.pattern, self.page_hint).await?;
        let page_len = keys.len();
        let fresh: Vec<String> = keys
            .into_iter()
            .filter(|k| self.seen.insert(k.clone()))
            .collect();
        debug!(
            pattern = self.pattern,
            cursor = %next,
            returned = page_len,
            fresh = fresh.len(),
            "scan page"
        );
        self.done = next.is_start();
        self.cursor = next;
        Ok(Some(fresh))
    }

    /// Distinct keys produced so far.
    pub fn seen(&self) -> usize {
        self.seen.len()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Every distinct key matching `pattern`, in discovery order, stopping early
/// once `limit` keys have been found.
pub async fn enumerate<S: Store + ?Sized>(
    store: &S,
    pattern: &str,
    limit: Option<usize>,
    page_hint: usize,
) -> Result<Vec<String>> {
    let mut pages = ScanPages::new(store, pattern, page_hint)?;
    if limit == Some(0) {
        return Ok(Vec::new());
    }
    let start = Instant::now();
    let mut keys = Vec::new();
    while let Some(page) = pages.next_page().await? {
        keys.extend(page);
        if let Some(limit) = limit {
            if keys.len() >= limit {
                keys.truncate(limit);
                break;
            }
        }
    }
    metrics::histogram!("kvsync_operation_duration_seconds", "operation" => "enumerate")
        .record(start.elapsed().as_secs_f64());
    debug!(pattern, found = keys.len(), partial = !pages.is_done(), "enumerate");
    Ok(keys)
}
