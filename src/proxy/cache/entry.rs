use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;

use crate::proxy::worker::ConnectionId;

/// Wakes whoever drives a reader's connection once the entry has news for it.
///
/// Implementations must not block and must not call back into the entry.
pub trait ReaderNotifier: Send + Sync {
    fn notify(&self, reader: ConnectionId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Unknown,
    Known(StatusCode),
}

impl ResponseStatus {
    pub fn code(self) -> Option<StatusCode> {
        match self {
            ResponseStatus::Unknown => None,
            ResponseStatus::Known(code) => Some(code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPhase {
    Pending,
    Streaming,
    Finished,
}

struct ReaderCursor {
    offset: usize,
    notifier: Arc<dyn ReaderNotifier>,
}

struct EntryState {
    buffer: Vec<u8>,
    status: ResponseStatus,
    finished: bool,
    aborted: bool,
    readers: HashMap<ConnectionId, ReaderCursor>,
}

/// One resource's response as it streams in, shared by every attached reader.
///
/// The buffer only grows. Each reader owns a cursor into it; cursors move
/// forward only and never pass the end of the buffer.
pub struct CacheEntry {
    state: Mutex<EntryState>,
}

impl CacheEntry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EntryState {
                buffer: Vec::new(),
                status: ResponseStatus::Unknown,
                finished: false,
                aborted: false,
                readers: HashMap::new(),
            }),
        }
    }

    /// Register `reader` with a cursor at byte zero. Re-attaching resets nothing.
    pub fn attach_reader(&self, reader: ConnectionId, notifier: Arc<dyn ReaderNotifier>) {
        let mut state = self.state.lock();
        state
            .readers
            .entry(reader)
            .or_insert(ReaderCursor {
                offset: 0,
                notifier,
            });
    }

    /// Drop the cursor for `reader`, returning how many readers remain.
    pub fn detach_reader(&self, reader: ConnectionId) -> usize {
        let mut state = self.state.lock();
        state.readers.remove(&reader);
        state.readers.len()
    }

    /// Producer side: extend the buffer. Readers are not woken here.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.state.lock().buffer.extend_from_slice(bytes);
    }

    /// Copy out up to `max` unread bytes for `reader` and advance its cursor past them.
    pub fn unread_for(&self, reader: ConnectionId, max: usize) -> Bytes {
        let mut state = self.state.lock();
        let EntryState {
            buffer, readers, ..
        } = &mut *state;
        let Some(cursor) = readers.get_mut(&reader) else {
            return Bytes::new();
        };
        let end = buffer.len().min(cursor.offset.saturating_add(max));
        let chunk = Bytes::copy_from_slice(&buffer[cursor.offset..end]);
        cursor.offset = end;
        chunk
    }

    /// Like [`unread_for`](Self::unread_for) without moving the cursor.
    pub fn peek_unread(&self, reader: ConnectionId, max: usize) -> Bytes {
        let state = self.state.lock();
        let Some(cursor) = state.readers.get(&reader) else {
            return Bytes::new();
        };
        let end = state.buffer.len().min(cursor.offset.saturating_add(max));
        Bytes::copy_from_slice(&state.buffer[cursor.offset..end])
    }

    /// Move the cursor of `reader` forward by `delivered` bytes, clamped to the buffer end.
    pub fn advance(&self, reader: ConnectionId, delivered: usize) {
        let mut state = self.state.lock();
        let len = state.buffer.len();
        if let Some(cursor) = state.readers.get_mut(&reader) {
            cursor.offset = len.min(cursor.offset.saturating_add(delivered));
        }
    }

    /// Offset already delivered to `reader`, if attached.
    pub fn reader_offset(&self, reader: ConnectionId) -> Option<usize> {
        self.state
            .lock()
            .readers
            .get(&reader)
            .map(|cursor| cursor.offset)
    }

    /// True once the entry is finished and `reader` has seen every byte.
    ///
    /// A reader that is not attached has nothing left to receive.
    pub fn is_reader_done(&self, reader: ConnectionId) -> bool {
        let state = self.state.lock();
        match state.readers.get(&reader) {
            Some(cursor) => state.finished && cursor.offset == state.buffer.len(),
            None => true,
        }
    }

    /// Wake every attached reader. Notifiers run after the lock is released.
    pub fn notify_readers(&self) {
        let targets: Vec<(ConnectionId, Arc<dyn ReaderNotifier>)> = {
            let state = self.state.lock();
            state
                .readers
                .iter()
                .map(|(id, cursor)| (*id, cursor.notifier.clone()))
                .collect()
        };
        for (id, notifier) in targets {
            notifier.notify(id);
        }
    }

    /// Record end of stream and wake readers so caught-up ones can finish.
    pub fn mark_finished(&self) {
        self.state.lock().finished = true;
        self.notify_readers();
    }

    /// Flag the response as truncated; it must never be served to later requests.
    pub fn mark_aborted(&self) {
        self.state.lock().aborted = true;
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> ResponseStatus {
        self.state.lock().status
    }

    /// Record the response status. Only the first call has any effect.
    pub fn set_status_once(&self, code: StatusCode) -> bool {
        let mut state = self.state.lock();
        if state.status != ResponseStatus::Unknown {
            return false;
        }
        state.status = ResponseStatus::Known(code);
        true
    }

    /// Try to extract the status from the buffered prefix if it is still unknown.
    pub fn capture_status<F>(&self, parse: F) -> ResponseStatus
    where
        F: FnOnce(&[u8]) -> Option<StatusCode>,
    {
        let mut state = self.state.lock();
        if state.status == ResponseStatus::Unknown {
            if let Some(code) = parse(&state.buffer) {
                state.status = ResponseStatus::Known(code);
            }
        }
        state.status
    }

    pub fn phase(&self) -> EntryPhase {
        let state = self.state.lock();
        if state.finished {
            EntryPhase::Finished
        } else if state.buffer.is_empty() {
            EntryPhase::Pending
        } else {
            EntryPhase::Streaming
        }
    }

    /// Whether the registry should drop this entry now.
    ///
    /// Only finished entries without readers qualify, and only when they hold
    /// a truncated or non-success response. An unknown status defers the
    /// decision.
    pub fn should_evict(&self) -> bool {
        let state = self.state.lock();
        if !state.finished || !state.readers.is_empty() {
            return false;
        }
        if state.aborted {
            return true;
        }
        match state.status {
            ResponseStatus::Known(code) => !code.is_success(),
            ResponseStatus::Unknown => false,
        }
    }
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("len", &state.buffer.len())
            .field("status", &state.status)
            .field("finished", &state.finished)
            .field("aborted", &state.aborted)
            .field("readers", &state.readers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingNotifier {
        woken: StdMutex<Vec<ConnectionId>>,
    }

    impl ReaderNotifier for RecordingNotifier {
        fn notify(&self, reader: ConnectionId) {
            self.woken.lock().unwrap().push(reader);
        }
    }

    fn notifier() -> Arc<RecordingNotifier> {
        Arc::new(RecordingNotifier::default())
    }

    fn parse_ok(_: &[u8]) -> Option<StatusCode> {
        Some(StatusCode::OK)
    }

    #[test]
    fn readers_receive_full_buffer_from_zero() {
        let entry = CacheEntry::new();
        let early = ConnectionId::from_raw(1);
        let late = ConnectionId::from_raw(2);
        let wake = notifier();

        entry.attach_reader(early, wake.clone());
        entry.append(b"AB");
        assert_eq!(&entry.unread_for(early, 64)[..], b"AB");

        entry.attach_reader(late, wake.clone());
        entry.append(b"C");
        assert_eq!(&entry.unread_for(early, 64)[..], b"C");
        assert_eq!(&entry.unread_for(late, 64)[..], b"ABC");
        assert!(entry.unread_for(late, 64).is_empty());
    }

    #[test]
    fn unread_respects_max_and_keeps_order() {
        let entry = CacheEntry::new();
        let reader = ConnectionId::from_raw(7);
        entry.attach_reader(reader, notifier());
        entry.append(b"0123456789");

        let mut seen = Vec::new();
        let mut last_offset = 0;
        loop {
            let chunk = entry.unread_for(reader, 3);
            if chunk.is_empty() {
                break;
            }
            let offset = entry.reader_offset(reader).unwrap();
            assert!(offset > last_offset && offset <= entry.len());
            last_offset = offset;
            seen.extend_from_slice(&chunk);
        }
        assert_eq!(seen, b"0123456789");
    }

    #[test]
    fn peek_then_partial_advance() {
        let entry = CacheEntry::new();
        let reader = ConnectionId::from_raw(3);
        entry.attach_reader(reader, notifier());
        entry.append(b"hello");

        assert_eq!(&entry.peek_unread(reader, 16)[..], b"hello");
        entry.advance(reader, 2);
        assert_eq!(&entry.peek_unread(reader, 16)[..], b"llo");
        entry.advance(reader, 100);
        assert_eq!(entry.reader_offset(reader), Some(5));
    }

    #[test]
    fn reader_done_requires_finish_and_catch_up() {
        let entry = CacheEntry::new();
        let reader = ConnectionId::from_raw(4);
        entry.attach_reader(reader, notifier());
        entry.append(b"xyz");
        assert!(!entry.is_reader_done(reader));

        entry.mark_finished();
        assert!(!entry.is_reader_done(reader));
        entry.unread_for(reader, 64);
        assert!(entry.is_reader_done(reader));
    }

    #[test]
    fn detaching_one_reader_leaves_others_untouched() {
        let entry = CacheEntry::new();
        let a = ConnectionId::from_raw(10);
        let b = ConnectionId::from_raw(11);
        let wake = notifier();
        entry.attach_reader(a, wake.clone());
        entry.attach_reader(b, wake.clone());
        entry.append(b"data");
        entry.unread_for(b, 2);

        assert_eq!(entry.detach_reader(a), 1);
        assert_eq!(entry.reader_offset(b), Some(2));
        assert_eq!(entry.len(), 4);
        assert_eq!(&entry.unread_for(b, 64)[..], b"ta");
    }

    #[test]
    fn notify_wakes_each_attached_reader() {
        let entry = CacheEntry::new();
        let wake = notifier();
        entry.attach_reader(ConnectionId::from_raw(1), wake.clone());
        entry.attach_reader(ConnectionId::from_raw(2), wake.clone());
        entry.notify_readers();

        let mut woken = wake.woken.lock().unwrap().clone();
        woken.sort_by_key(|id| id.as_u64());
        assert_eq!(woken, vec![ConnectionId::from_raw(1), ConnectionId::from_raw(2)]);
    }

    #[test]
    fn finishing_notifies_readers() {
        let entry = CacheEntry::new();
        let wake = notifier();
        entry.attach_reader(ConnectionId::from_raw(5), wake.clone());
        entry.mark_finished();
        assert_eq!(wake.woken.lock().unwrap().len(), 1);
    }

    #[test]
    fn status_is_set_once() {
        let entry = CacheEntry::new();
        assert_eq!(entry.status(), ResponseStatus::Unknown);
        assert!(entry.set_status_once(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!entry.set_status_once(StatusCode::OK));
        assert_eq!(
            entry.status(),
            ResponseStatus::Known(StatusCode::SERVICE_UNAVAILABLE)
        );
        assert_eq!(
            entry.capture_status(parse_ok),
            ResponseStatus::Known(StatusCode::SERVICE_UNAVAILABLE)
        );
    }

    #[test]
    fn phases_follow_producer_progress() {
        let entry = CacheEntry::new();
        assert_eq!(entry.phase(), EntryPhase::Pending);
        entry.append(b"");
        assert_eq!(entry.phase(), EntryPhase::Pending);
        entry.append(b"HTTP/1.1");
        assert_eq!(entry.phase(), EntryPhase::Streaming);
        entry.mark_finished();
        assert_eq!(entry.phase(), EntryPhase::Finished);
    }

    #[test]
    fn eviction_rules() {
        let reader = ConnectionId::from_raw(1);

        let failed = CacheEntry::new();
        failed.attach_reader(reader, notifier());
        failed.set_status_once(StatusCode::INTERNAL_SERVER_ERROR);
        failed.mark_finished();
        assert!(!failed.should_evict(), "readers still attached");
        failed.detach_reader(reader);
        assert!(failed.should_evict());

        let ok = CacheEntry::new();
        ok.set_status_once(StatusCode::OK);
        ok.mark_finished();
        assert!(!ok.should_evict());

        let unknown = CacheEntry::new();
        unknown.append(b"ABC");
        unknown.mark_finished();
        assert!(!unknown.should_evict(), "unknown status defers eviction");

        let aborted = CacheEntry::new();
        aborted.set_status_once(StatusCode::OK);
        aborted.mark_aborted();
        assert!(!aborted.should_evict(), "not finished yet");
        aborted.mark_finished();
        assert!(aborted.should_evict());
    }
}
