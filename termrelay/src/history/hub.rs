//! Fan-out of history chunks to live observers.
//!
//! One mutex guards the history buffer, the observer slots, and the
//! closed flag together. Because appending and queueing to every
//! observer happen under that single lock, a replay-then-live attach is
//! atomic with respect to appends: no chunk appended after the replay
//! snapshot is missed, and none is delivered twice.

use std::ops::Range;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use log::{debug, trace};
use tokio::sync::mpsc;

use super::buffer::{HistoryBuffer, OutputChunk};

/// An event delivered to a session observer.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A history chunk, in sequence order.
    Chunk(OutputChunk),

    /// End of stream. `error` carries the transport failure message when
    /// the session failed rather than closed cleanly.
    Closed { error: Option<String> },
}

struct ObserverSlot {
    id: u64,
    tx: mpsc::UnboundedSender<MonitorEvent>,
}

struct HubState {
    history: HistoryBuffer,
    observers: Vec<ObserverSlot>,
    /// `None` while live; `Some(error)` once closed.
    closed: Option<Option<String>>,
    next_observer_id: u64,
}

/// Owns a session's history and fans new chunks out to observers.
///
/// The hub is owned by its session; observers hold only a [`Weak`]
/// reference back for detach, so no ownership cycle exists and observer
/// lifetime never extends session lifetime.
pub struct BroadcastHub {
    state: Mutex<HubState>,
}

impl BroadcastHub {
    /// Create an empty, live hub.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                history: HistoryBuffer::new(),
                observers: Vec::new(),
                closed: None,
                next_observer_id: 0,
            }),
        }
    }

    /// Append a chunk and deliver it to every live observer before
    /// returning. Returns the assigned sequence number, or `None` if the
    /// hub is already closed (the chunk is dropped).
    pub fn append(&self, bytes: Bytes, ends_with_prompt: bool) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        if state.closed.is_some() {
            debug!("append on closed hub dropped ({} bytes)", bytes.len());
            return None;
        }
        let chunk = state.history.append(bytes, ends_with_prompt);
        let seq = chunk.seq;
        state
            .observers
            .retain(|o| o.tx.send(MonitorEvent::Chunk(chunk.clone())).is_ok());
        Some(seq)
    }

    /// Full ordered replay from sequence 0. Available before and after
    /// closure: history up to a failure stays queryable.
    pub fn replay(&self) -> Vec<OutputChunk> {
        self.state.lock().unwrap().history.replay()
    }

    /// Total bytes recorded so far.
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().unwrap().history.total_bytes()
    }

    /// Extract a byte range of the history.
    pub fn slice(&self, range: Range<u64>) -> Vec<u8> {
        self.state.lock().unwrap().history.slice(range)
    }

    /// Attach a new observer: the full current replay is queued first,
    /// then the observer registers for live chunks. On a closed hub the
    /// replay is followed immediately by `Closed` and there is no live
    /// phase.
    pub fn attach(self: &Arc<Self>) -> MonitorStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();

        for chunk in state.history.iter() {
            let _ = tx.send(MonitorEvent::Chunk(chunk.clone()));
        }

        let id = state.next_observer_id;
        state.next_observer_id += 1;

        match &state.closed {
            Some(error) => {
                let _ = tx.send(MonitorEvent::Closed {
                    error: error.clone(),
                });
            }
            None => state.observers.push(ObserverSlot { id, tx }),
        }

        trace!("observer {} attached ({} chunks replayed)", id, state.history.len());

        MonitorStream {
            rx,
            hub: Arc::downgrade(self),
            id,
            cursor: None,
        }
    }

    /// Remove an observer. Idempotent; unknown ids are ignored.
    fn detach(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.observers.retain(|o| o.id != id);
    }

    /// Close the hub: every observer receives `Closed { error }` and is
    /// dropped. Repeated closes are ignored. The history remains
    /// queryable via [`replay`](Self::replay).
    pub fn close(&self, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(error.clone());
        for observer in state.observers.drain(..) {
            let _ = observer.tx.send(MonitorEvent::Closed {
                error: error.clone(),
            });
        }
    }

    /// Number of currently registered observers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().unwrap().observers.len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription to one session's history: replay first, then live
/// chunks, terminated by [`MonitorEvent::Closed`].
///
/// Dropping the stream detaches it; an explicit [`detach`](Self::detach)
/// reads better at call sites that stop watching early.
pub struct MonitorStream {
    rx: mpsc::UnboundedReceiver<MonitorEvent>,
    hub: Weak<BroadcastHub>,
    id: u64,
    cursor: Option<u64>,
}

impl MonitorStream {
    /// Sequence number of the last chunk yielded, if any.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Stop observing. Equivalent to dropping the stream.
    pub fn detach(self) {}
}

impl Stream for MonitorStream {
    type Item = MonitorEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.rx.poll_recv(cx);
        if let Poll::Ready(Some(MonitorEvent::Chunk(chunk))) = &polled {
            this.cursor = Some(chunk.seq);
        }
        polled
    }
}

impl Drop for MonitorStream {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.detach(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn seed(hub: &Arc<BroadcastHub>) {
        hub.append(Bytes::from_static(b"__p__$ "), true);
        hub.append(Bytes::from_static(b"pwd\r\n/home/ops\r\n"), false);
        hub.append(Bytes::from_static(b"__p__$ "), true);
    }

    async fn collect_chunks(stream: &mut MonitorStream, n: usize) -> Vec<OutputChunk> {
        let mut out = Vec::new();
        while out.len() < n {
            match stream.next().await {
                Some(MonitorEvent::Chunk(c)) => out.push(c),
                other => panic!("expected chunk, got {:?}", other),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_attach_replays_then_delivers_live() {
        let hub = Arc::new(BroadcastHub::new());
        seed(&hub);

        let mut stream = hub.attach();
        hub.append(Bytes::from_static(b"whoami\r\n"), false);

        let chunks = collect_chunks(&mut stream, 4).await;
        let seqs: Vec<u64> = chunks.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(stream.cursor(), Some(3));
    }

    #[tokio::test]
    async fn test_all_observers_see_identical_order() {
        let hub = Arc::new(BroadcastHub::new());
        let mut a = hub.attach();
        let mut b = hub.attach();
        seed(&hub);

        let seq_a: Vec<u64> = collect_chunks(&mut a, 3).await.iter().map(|c| c.seq).collect();
        let seq_b: Vec<u64> = collect_chunks(&mut b, 3).await.iter().map(|c| c.seq).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[tokio::test]
    async fn test_attach_racing_appends_sees_every_chunk_once() {
        let hub = Arc::new(BroadcastHub::new());
        let writer = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..50u64 {
                    hub.append(Bytes::from(vec![b'a' + (i % 26) as u8]), false);
                    if i % 5 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        tokio::task::yield_now().await;

        let mut stream = hub.attach();
        writer.await.unwrap();

        let seqs: Vec<u64> = collect_chunks(&mut stream, 50)
            .await
            .iter()
            .map(|c| c.seq)
            .collect();
        assert_eq!(seqs, (0..50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_detach_is_idempotent_and_drop_detaches() {
        let hub = Arc::new(BroadcastHub::new());
        let a = hub.attach();
        let b = hub.attach();
        assert_eq!(hub.observer_count(), 2);

        a.detach();
        assert_eq!(hub.observer_count(), 1);
        hub.detach(0); // already gone
        assert_eq!(hub.observer_count(), 1);

        drop(b);
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_reattach_yields_identical_replay() {
        let hub = Arc::new(BroadcastHub::new());
        seed(&hub);

        let mut first = hub.attach();
        let replay_a = collect_chunks(&mut first, 3).await;
        first.detach();

        let mut second = hub.attach();
        let replay_b = collect_chunks(&mut second, 3).await;

        for (a, b) in replay_a.iter().zip(replay_b.iter()) {
            assert_eq!(a.seq, b.seq);
            assert_eq!(a.bytes, b.bytes);
        }
    }

    #[tokio::test]
    async fn test_close_signals_observers_and_ends_stream() {
        let hub = Arc::new(BroadcastHub::new());
        seed(&hub);
        let mut stream = hub.attach();
        hub.close(Some("connection reset".into()));

        let _ = collect_chunks(&mut stream, 3).await;
        match stream.next().await {
            Some(MonitorEvent::Closed { error }) => {
                assert_eq!(error.as_deref(), Some("connection reset"));
            }
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_attach_on_closed_hub_replays_then_closes() {
        let hub = Arc::new(BroadcastHub::new());
        seed(&hub);
        hub.close(None);

        let mut stream = hub.attach();
        let chunks = collect_chunks(&mut stream, 3).await;
        assert_eq!(chunks.len(), 3);
        assert!(matches!(
            stream.next().await,
            Some(MonitorEvent::Closed { error: None })
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_append_after_close_is_dropped() {
        let hub = Arc::new(BroadcastHub::new());
        seed(&hub);
        hub.close(None);
        assert_eq!(hub.append(Bytes::from_static(b"late"), false), None);
        assert_eq!(hub.replay().len(), 3);
    }

    #[tokio::test]
    async fn test_pending_until_append() {
        let hub = Arc::new(BroadcastHub::new());
        let mut stream = tokio_test::task::spawn(hub.attach());

        assert!(stream.enter(|cx, s| s.poll_next(cx)).is_pending());
        hub.append(Bytes::from_static(b"data"), false);
        assert!(stream.enter(|cx, s| s.poll_next(cx)).is_ready());
    }
}
