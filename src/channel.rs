//! Unbounded FIFO event queue with a writer/reader split.
//!
//! One [`EventChannel`] backs each coordinator. Any number of producers emit
//! concurrently; exactly one [`EventReader`] drains. Sequence numbers are
//! stamped at write time, so two events observed by the reader are ordered
//! by `seq` exactly as they were written.

use crate::events::Event;
use crate::{Error, Result};
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// What travels on the queue: events on the happy path, one terminal fault
/// when the run fails.
enum ChannelItem {
    Event(Event),
    Fault(Error),
}

/// Write half of the queue.
///
/// Emitting never blocks on the reader (the queue is unbounded); stamping and
/// enqueueing happen under one short mutex so the reader always observes
/// events in sequence order, even with concurrent producers. After
/// [`close`](EventChannel::close), emits fail with [`Error::ClosedChannel`]
/// and are counted for telemetry.
pub struct EventChannel {
    tx: mpsc::UnboundedSender<ChannelItem>,
    next_seq: Mutex<u64>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl EventChannel {
    /// Creates a connected channel/reader pair.
    pub fn new() -> (Self, EventReader) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_seq: Mutex::new(0),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            },
            EventReader { rx },
        )
    }

    /// Stamps a sequence number onto `event` and enqueues it.
    ///
    /// Returns the stamped event so callers (the coordinator's bubbling path)
    /// can forward the exact delivered value.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedChannel`] after [`close`](EventChannel::close); the
    /// event is dropped and the drop counter incremented.
    pub fn emit(&self, mut event: Event) -> Result<Event> {
        if self.closed.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            log::warn!(
                "event dropped on closed channel (kind={}, total dropped={})",
                event.payload.kind(),
                self.dropped.load(Ordering::SeqCst)
            );
            return Err(Error::ClosedChannel);
        }

        let send_result = {
            let mut seq = self.next_seq.lock().expect("seq lock poisoned");
            event.seq = *seq;
            *seq += 1;
            self.tx.send(ChannelItem::Event(event.clone()))
        };

        match send_result {
            Ok(()) => Ok(event),
            Err(_) => {
                // Reader dropped; treat like a closed channel.
                self.dropped.fetch_add(1, Ordering::SeqCst);
                Err(Error::ClosedChannel)
            }
        }
    }

    /// Enqueues a terminal fault and closes the channel. The reader yields
    /// the fault as its final item.
    pub fn fail(&self, error: Error) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(ChannelItem::Fault(error));
        }
    }

    /// Closes the channel. The reader completes once the queue drains.
    /// Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True once the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of events dropped by emit-after-close.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// Read half of the queue: a finite, ordered stream consumed by the run
/// driver. Completes when the channel is closed and drained; yields a single
/// `Err` item first when the run faulted.
pub struct EventReader {
    rx: mpsc::UnboundedReceiver<ChannelItem>,
}

impl Stream for EventReader {
    type Item = Result<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(ChannelItem::Event(event))) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(Some(ChannelItem::Fault(error))) => Poll::Ready(Some(Err(error))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Boxed event stream handed to the run's caller.
///
/// The reader completes only when every sender is gone, so the coordinator
/// drops its [`EventChannel`] on close to hang up the underlying sender.
pub type BoxedEventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;
