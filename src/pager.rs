use std::time::Instant;

use tracing::debug;

use crate::drain::pop_count;
use crate::error::{Error, Result};
use crate::store::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageMode {
    /// Pop each batch off the head. Every batch is atomic; the walk as a
    /// whole is not.
    Destructive,
    /// Read fixed index windows without removing anything. The length is
    /// read once; concurrent writers can cause items to be skipped or seen
    /// twice.
    Snapshot,
}

enum State {
    Fresh,
    Reading { next: u64, len: u64 },
    Done,
}

/// Walks a list in batches of at most `window` items. Once
/// [`next_batch`](Self::next_batch) returns `None` the pager is spent.
pub struct ListPager<'a, S: Store + ?Sized> {
    store: &'a S,
    key: String,
    window: usize,
    mode: PageMode,
    state: State,
}

impl<'a, S: Store + ?Sized> ListPager<'a, S> {
    pub fn new(store: &'a S, key: impl Into<String>, window: usize, mode: PageMode) -> Result<Self> {
        if window == 0 {
            return Err(Error::InvalidArgument("page window must be at least 1"));
        }
        Ok(Self {
            store,
            key: key.into(),
            window,
            mode,
            state: State::Fresh,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> PageMode {
        self.mode
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    pub async fn next_batch(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        if self.is_done() {
            return Ok(None);
        }
        let start = Instant::now();
        let batch = match self.mode {
            PageMode::Destructive => self.next_destructive().await?,
            PageMode::Snapshot => self.next_snapshot().await?,
        };
        metrics::histogram!("kvsync_operation_duration_seconds", "operation" => "next_batch")
            .record(start.elapsed().as_secs_f64());
        debug!(
            key = %self.key,
            mode = ?self.mode,
            items = batch.as_ref().map(Vec::len),
            done = self.is_done(),
            "list page"
        );
        Ok(batch)
    }

    async fn next_destructive(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        let batch = pop_count(self.store, &self.key, self.window).await?;
        if batch.is_empty() {
            self.state = State::Done;
            return Ok(None);
        }
        if batch.len() < self.window {
            self.state = State::Done;
        }
        Ok(Some(batch))
    }

    async fn next_snapshot(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        let (next, len) = match self.state {
            State::Fresh => (0, self.store.llen(&self.key).await?),
            State::Reading { next, len } => (next, len),
            State::Done => return Ok(None),
        };
        if next >= len {
            self.state = State::Done;
            return Ok(None);
        }
        let window = self.window as u64;
        let (start, stop) = (to_index(next), to_index(next + window - 1));
        let batch = self.store.lrange(&self.key, start, stop).await?;
        if batch.is_empty() {
            self.state = State::Done;
            return Ok(None);
        }
        self.state = State::Reading { next: next + window, len };
        Ok(Some(batch))
    }
}

fn to_index(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
