//! Broadcast + history store for terminal events.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::{Stream, StreamExt, future, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// History size limit (4 MiB of terminal output).
const HISTORY_BYTES: usize = 4 * 1024 * 1024;

const CHANNEL_CAPACITY: usize = 10_000;

/// Event published by an interactive terminal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Raw bytes read from the terminal.
    Output(Vec<u8>),
    /// The session ended. Always the last event, published once.
    Exit,
}

impl TerminalEvent {
    fn approx_bytes(&self) -> usize {
        match self {
            Self::Output(bytes) => bytes.len(),
            Self::Exit => 0,
        }
    }
}

struct Inner {
    history: VecDeque<TerminalEvent>,
    total_bytes: usize,
}

/// Event store with broadcast and history support.
///
/// Late subscribers replay history and then continue with live events, so a
/// consumer attaching after the first prompt still sees it.
pub struct EventStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<TerminalEvent>,
    exited: AtomicBool,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            exited: AtomicBool::new(false),
        }
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| {
            tracing::warn!("event store lock was poisoned, recovering");
            PoisonError::into_inner(e)
        })
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| {
            tracing::warn!("event store lock was poisoned, recovering");
            PoisonError::into_inner(e)
        })
    }

    // Sending under the write lock keeps `subscribe` from seeing an event in
    // both the history snapshot and the live receiver.
    fn push(&self, event: TerminalEvent) {
        let bytes = event.approx_bytes();
        let mut inner = self.write_inner();
        let _ = self.sender.send(event.clone());

        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.approx_bytes());
            } else {
                break;
            }
        }
        inner.history.push_back(event);
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Publish an output chunk. Empty chunks and chunks after exit are dropped.
    pub fn push_output(&self, chunk: Vec<u8>) {
        if chunk.is_empty() || self.has_exited() {
            return;
        }
        self.push(TerminalEvent::Output(chunk));
    }

    /// Publish the exit event.
    ///
    /// Returns `false` if exit was already published; the event is never
    /// sent twice.
    pub fn push_exit(&self) -> bool {
        if self.exited.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.push(TerminalEvent::Exit);
        true
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<TerminalEvent> {
        self.read_inner().history.iter().cloned().collect()
    }

    /// Subscribe to history followed by live events, ending after `Exit`.
    #[must_use]
    pub fn subscribe(&self) -> TerminalSubscription {
        let (history, rx) = {
            let inner = self.read_inner();
            let rx = self.sender.subscribe();
            (inner.history.iter().cloned().collect::<Vec<_>>(), rx)
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));

        TerminalSubscription {
            stream: hist.chain(live).boxed(),
            done: false,
        }
    }
}

/// A live subscription to a terminal's events.
///
/// Dropping the subscription (or calling [`TerminalSubscription::unsubscribe`])
/// detaches it; the session keeps running.
pub struct TerminalSubscription {
    stream: BoxStream<'static, TerminalEvent>,
    done: bool,
}

impl TerminalSubscription {
    /// Detach from the session.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Stream for TerminalSubscription {
    type Item = TerminalEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let next = self.stream.poll_next_unpin(cx);
        if let Poll::Ready(Some(TerminalEvent::Exit) | None) = &next {
            self.done = true;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_published_once() {
        let store = EventStore::new();
        store.push_output(b"hello".to_vec());
        assert!(store.push_exit());
        assert!(!store.push_exit());
        store.push_output(b"late".to_vec());

        let events: Vec<_> = store.subscribe().collect().await;
        assert_eq!(
            events,
            vec![TerminalEvent::Output(b"hello".to_vec()), TerminalEvent::Exit]
        );
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_history_then_live() {
        let store = EventStore::new();
        store.push_output(b"one".to_vec());

        let sub = store.subscribe();
        store.push_output(b"two".to_vec());
        store.push_exit();

        let events: Vec<_> = sub.collect().await;
        assert_eq!(
            events,
            vec![
                TerminalEvent::Output(b"one".to_vec()),
                TerminalEvent::Output(b"two".to_vec()),
                TerminalEvent::Exit,
            ]
        );
    }

    #[test]
    fn test_empty_chunks_are_dropped() {
        let store = EventStore::new();
        store.push_output(Vec::new());
        assert!(store.get_history().is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let store = EventStore::new();
        let chunk = vec![b'x'; 1024 * 1024];
        for _ in 0..6 {
            store.push_output(chunk.clone());
        }
        store.push_exit();
        let history = store.get_history();
        assert_eq!(history.len(), 5);
        assert_eq!(history.last(), Some(&TerminalEvent::Exit));
    }
}
