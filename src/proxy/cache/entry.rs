use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

use super::buffer::{BufferError, GrowableBuffer};
use super::store::StoreCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Complete,
    Failed,
}

/// Lifecycle of one origin fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// The origin response is still arriving and every byte is retained.
    Fetching,
    /// The full response is buffered and replays from offset 0.
    Done,
    /// Caching was abandoned. Attached readers keep streaming while the prefix they have all
    /// consumed is trimmed; `aborted` tells the producer nobody is listening any more.
    Passthrough {
        aborted: bool,
        end: Option<StreamEnd>,
    },
}

impl FetchState {
    pub fn is_passthrough(self) -> bool {
        matches!(self, FetchState::Passthrough { .. })
    }

    pub fn is_aborted(self) -> bool {
        matches!(self, FetchState::Passthrough { aborted: true, .. })
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            FetchState::Passthrough {
                end: Some(StreamEnd::Failed),
                ..
            }
        )
    }

    pub fn is_eof(self) -> bool {
        matches!(
            self,
            FetchState::Done | FetchState::Passthrough { end: Some(_), .. }
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            FetchState::Fetching => "fetching",
            FetchState::Done => "done",
            FetchState::Passthrough { .. } => "passthrough",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cache entry '{key}' no longer accepts readers")]
pub struct AttachError {
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub state: FetchState,
    pub received_total: u64,
    pub base_offset: u64,
    pub buffered: usize,
    pub readers: usize,
}

#[derive(Debug)]
pub(super) enum ReadOutcome {
    Data(Bytes),
    Eof,
    Failed,
    Behind { offset: u64, base_offset: u64 },
}

#[derive(Debug)]
struct ReaderCursor {
    offset: u64,
    dead: bool,
    peer: Option<SocketAddr>,
}

#[derive(Debug)]
struct EntryInner {
    buffer: GrowableBuffer,
    received_total: u64,
    base_offset: u64,
    state: FetchState,
    readers: HashMap<u64, ReaderCursor>,
    // Cleared once the entry leaves the store; later bytes are no longer charged to it.
    accounted: bool,
}

impl EntryInner {
    fn poll_read(&self, offset: u64, max: usize) -> Option<ReadOutcome> {
        if self.state.is_failed() {
            return Some(ReadOutcome::Failed);
        }
        if offset < self.received_total {
            let behind = ReadOutcome::Behind {
                offset,
                base_offset: self.base_offset,
            };
            if offset < self.base_offset {
                return Some(behind);
            }
            let Ok(start) = usize::try_from(offset - self.base_offset) else {
                return Some(behind);
            };
            let pending = usize::try_from(self.received_total - offset).unwrap_or(usize::MAX);
            let len = self
                .buffer
                .len()
                .saturating_sub(start)
                .min(pending)
                .min(max);
            return Some(match self.buffer.slice(start, len) {
                Some(bytes) if !bytes.is_empty() => ReadOutcome::Data(Bytes::copy_from_slice(bytes)),
                _ => behind,
            });
        }
        if self.state.is_eof() {
            return Some(ReadOutcome::Eof);
        }
        None
    }

    fn min_live_offset(&self) -> Option<u64> {
        self.readers
            .values()
            .filter(|cursor| !cursor.dead)
            .map(|cursor| cursor.offset)
            .min()
    }
}

/// One origin fetch shared by a single producer and any number of streaming readers.
#[derive(Debug)]
pub struct CacheEntry {
    key: String,
    inner: Mutex<EntryInner>,
    wake: Notify,
    hits: AtomicU64,
    next_reader_id: AtomicU64,
    counters: Arc<StoreCounters>,
}

impl CacheEntry {
    pub(super) fn new(key: String, counters: Arc<StoreCounters>) -> Self {
        Self {
            key,
            inner: Mutex::new(EntryInner {
                buffer: GrowableBuffer::new(),
                received_total: 0,
                base_offset: 0,
                state: FetchState::Fetching,
                readers: HashMap::new(),
                accounted: true,
            }),
            wake: Notify::new(),
            hits: AtomicU64::new(0),
            next_reader_id: AtomicU64::new(1),
            counters,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(super) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn reset_hits(&self) {
        self.hits.store(0, Ordering::Relaxed);
    }

    pub fn state(&self) -> FetchState {
        self.inner.lock().state
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().readers.len()
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let inner = self.inner.lock();
        EntrySnapshot {
            state: inner.state,
            received_total: inner.received_total,
            base_offset: inner.base_offset,
            buffered: inner.buffer.len(),
            readers: inner.readers.len(),
        }
    }

    /// Registers a new reader starting at offset 0. Entries in passthrough have already
    /// discarded bytes, so the caller must fetch directly instead.
    pub fn attach_reader(self: &Arc<Self>, peer: Option<SocketAddr>) -> Result<Reader, AttachError> {
        let mut inner = self.inner.lock();
        if inner.state.is_passthrough() {
            return Err(AttachError {
                key: self.key.clone(),
            });
        }
        Ok(self.attach_locked(&mut inner, peer))
    }

    pub(super) fn attach_creator(self: &Arc<Self>, peer: Option<SocketAddr>) -> Reader {
        let mut inner = self.inner.lock();
        self.attach_locked(&mut inner, peer)
    }

    fn attach_locked(self: &Arc<Self>, inner: &mut EntryInner, peer: Option<SocketAddr>) -> Reader {
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        inner.readers.insert(
            id,
            ReaderCursor {
                offset: 0,
                dead: false,
                peer,
            },
        );
        Reader {
            entry: Arc::clone(self),
            id,
            peer,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().state.is_aborted()
    }

    /// Appends origin bytes and wakes every reader. Returns the new received total, or `None`
    /// when the fetch was aborted and the bytes were discarded.
    pub fn append(&self, bytes: &[u8]) -> Result<Option<u64>, BufferError> {
        let received = {
            let mut inner = self.inner.lock();
            if inner.state.is_aborted() {
                return Ok(None);
            }
            inner.buffer.append(bytes)?;
            inner.received_total += bytes.len() as u64;
            if inner.accounted {
                self.counters.add_bytes(bytes.len());
            }
            inner.received_total
        };
        self.wake.notify_waiters();
        Ok(Some(received))
    }

    /// Moves a fetching entry to passthrough. Returns true only for the transition itself;
    /// completed entries never demote.
    pub fn demote_to_passthrough(&self) -> bool {
        let demoted = {
            let mut inner = self.inner.lock();
            if inner.state != FetchState::Fetching {
                return false;
            }
            let aborted = inner.readers.is_empty();
            inner.state = FetchState::Passthrough { aborted, end: None };
            self.trim_locked(&mut inner);
            true
        };
        if demoted {
            trace!(key = %self.key, "cache entry demoted to passthrough");
            self.wake.notify_waiters();
        }
        demoted
    }

    /// Records a clean end of the origin response.
    pub fn finish(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = match inner.state {
                FetchState::Fetching => FetchState::Done,
                FetchState::Passthrough { aborted, end: None } => FetchState::Passthrough {
                    aborted,
                    end: Some(StreamEnd::Complete),
                },
                other => other,
            };
            self.release_unread_locked(&mut inner);
        }
        self.wake.notify_waiters();
    }

    /// Records a failed fetch: releases the buffered bytes, resets the byte counters and wakes
    /// every reader so it can observe the failure. Returns the number of bytes released.
    pub fn fail(&self) -> usize {
        let released = {
            let mut inner = self.inner.lock();
            if inner.state == FetchState::Done {
                return 0;
            }
            let aborted = inner.state.is_aborted();
            inner.state = FetchState::Passthrough {
                aborted,
                end: Some(StreamEnd::Failed),
            };
            let released = inner.buffer.clear();
            if inner.accounted {
                self.counters.sub_bytes(released);
            }
            inner.received_total = 0;
            inner.base_offset = 0;
            released
        };
        self.wake.notify_waiters();
        released
    }

    /// Detaches the entry from store accounting once it has left the map. An in-flight fetch
    /// that nobody reads is aborted so its producer stops.
    pub(super) fn evict(&self) -> usize {
        let released = {
            let mut inner = self.inner.lock();
            let released = if inner.accounted {
                inner.accounted = false;
                let held = inner.buffer.len();
                self.counters.sub_bytes(held);
                held
            } else {
                0
            };
            if inner.state == FetchState::Fetching && inner.readers.is_empty() {
                inner.state = FetchState::Passthrough {
                    aborted: true,
                    end: None,
                };
            }
            released
        };
        self.wake.notify_waiters();
        released
    }

    /// Waits until bytes at `offset` are available or the fetch has ended.
    pub(super) async fn read_from(&self, offset: u64, max: usize) -> ReadOutcome {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let outcome = {
                let inner = self.inner.lock();
                inner.poll_read(offset, max)
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            notified.await;
        }
    }

    pub(super) fn advance_reader(&self, id: u64, offset: u64) -> usize {
        let mut inner = self.inner.lock();
        if let Some(cursor) = inner.readers.get_mut(&id) {
            cursor.offset = offset;
        }
        self.trim_locked(&mut inner)
    }

    pub(super) fn mark_reader_dead(&self, id: u64) -> usize {
        let mut inner = self.inner.lock();
        if let Some(cursor) = inner.readers.get_mut(&id) {
            cursor.dead = true;
        }
        self.trim_locked(&mut inner)
    }

    fn detach(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(cursor) = inner.readers.remove(&id) else {
            return;
        };
        trace!(
            key = %self.key,
            reader = id,
            peer = ?cursor.peer,
            offset = cursor.offset,
            "reader detached"
        );
        let state = inner.state;
        if let FetchState::Passthrough { aborted, end } = state
            && !aborted
            && inner.readers.is_empty()
        {
            inner.state = FetchState::Passthrough { aborted: true, end };
        }
        if self.release_unread_locked(&mut inner) == 0 {
            self.trim_locked(&mut inner);
        }
    }

    // A finished passthrough entry without readers can never be read again, since attach is
    // refused in passthrough.
    fn release_unread_locked(&self, inner: &mut EntryInner) -> usize {
        let FetchState::Passthrough { end: Some(_), .. } = inner.state else {
            return 0;
        };
        if !inner.readers.is_empty() {
            return 0;
        }
        let released = inner.buffer.clear();
        if inner.accounted {
            self.counters.sub_bytes(released);
        }
        inner.received_total = 0;
        inner.base_offset = 0;
        if released > 0 {
            trace!(key = %self.key, released, "released unread passthrough bytes");
        }
        released
    }

    // Only passthrough entries are trimmed; fetching and completed entries keep every byte so
    // late readers can replay from 0.
    fn trim_locked(&self, inner: &mut EntryInner) -> usize {
        if !inner.state.is_passthrough() {
            return 0;
        }
        let Some(min_offset) = inner.min_live_offset() else {
            return 0;
        };
        if min_offset <= inner.base_offset {
            return 0;
        }
        let wanted = usize::try_from(min_offset - inner.base_offset).unwrap_or(usize::MAX);
        let dropped = inner.buffer.drop_front(wanted);
        inner.base_offset += dropped as u64;
        if inner.accounted {
            self.counters.sub_bytes(dropped);
        }
        dropped
    }
}

/// A streaming consumer's registration on a [`CacheEntry`]. Dropping it detaches the reader.
#[derive(Debug)]
pub struct Reader {
    pub(super) entry: Arc<CacheEntry>,
    pub(super) id: u64,
    pub(super) peer: Option<SocketAddr>,
}

impl Reader {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.entry
            .inner
            .lock()
            .readers
            .get(&self.id)
            .map(|cursor| cursor.offset)
            .unwrap_or(0)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.entry.detach(self.id);
    }
}
