//! High/low watermark delivery queue.
//!
//! [`channel`] creates the bounded, watermark-accounted queue linking the
//! producer side ([`QueueSource`]) to a single consumer
//! ([`DeliveryStream`](crate::stream::DeliveryStream)).
//!
//! Accounting uses hysteresis to avoid rapid pause/resume oscillation:
//! the push that raises the buffer to the high watermark returns
//! [`PushOutcome::Pause`], and [`QueueDelegate::on_consumer_ready`] fires
//! once the consumer drains the buffer back below the low watermark. The
//! delegate is also signalled whenever the consumer parks on an empty
//! queue, which both primes production before anything was pushed and
//! keeps the producer live if a ready signal raced with its own park.
//!
//! # Locking
//!
//! The queue's internal lock is never held across a delegate call: each
//! operation computes its outcome under the lock, releases it, and only
//! then invokes the delegate. Delegate implementations are therefore free
//! to re-enter the queue.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use tracing::debug;

use crate::stream::DeliveryStream;

/// Outcome of pushing one element into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The element was accepted and the producer may keep producing.
    Continue,
    /// The element was accepted, but the buffer reached the high
    /// watermark; the producer should stop until
    /// [`QueueDelegate::on_consumer_ready`] fires.
    Pause,
    /// The element was discarded: the queue was already finished or the
    /// consumer abandoned the stream.
    Dropped,
}

/// Callbacks invoked by the queue's watermark accounting.
///
/// Both callbacks are invoked with no queue lock held and may be called
/// from whatever task or thread drives the consumer.
pub trait QueueDelegate: Send + Sync {
    /// The buffer drained below the low watermark (or the consumer is
    /// waiting on an empty queue); production may continue.
    fn on_consumer_ready(&self);

    /// The consumer dropped its stream; no element will ever be
    /// consumed again.
    fn on_consumer_abandoned(&self);
}

/// Queue state shared by the source and the consumer stream.
pub(crate) struct Shared<T, E> {
    inner: Mutex<Inner<T, E>>,
}

struct Inner<T, E> {
    buffer: VecDeque<Result<T, E>>,
    low_watermark: usize,
    high_watermark: usize,
    /// Consumer demand flag (hysteresis): set when the ready signal has
    /// fired, cleared when a push reaches the high watermark.
    demand: bool,
    /// Producer called `finish()`; remaining elements drain, then the
    /// consumer observes end-of-stream.
    finished: bool,
    /// Consumer dropped the stream; all further pushes are discarded.
    abandoned: bool,
    /// Waker of the consumer task parked on an empty buffer.
    waker: Option<Waker>,
    delegate: Option<Weak<dyn QueueDelegate>>,
}

impl<T, E> Shared<T, E> {
    /// Consumer-side poll: pops the next element or parks the consumer.
    ///
    /// Called only from the single consumer stream.
    pub(crate) fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Option<Result<T, E>>> {
        let (result, ready) = {
            let mut inner = self.inner.lock();
            if let Some(item) = inner.buffer.pop_front() {
                let ready = if !inner.demand
                    && !inner.finished
                    && inner.buffer.len() < inner.low_watermark
                {
                    inner.demand = true;
                    inner.delegate.clone()
                } else {
                    None
                };
                (Poll::Ready(Some(item)), ready)
            } else if inner.finished {
                (Poll::Ready(None), None)
            } else {
                inner.waker = Some(cx.waker().clone());
                // A consumer parked on an empty queue is unconditional
                // demand. Signalled on every park, not just the first:
                // a demand-gated signal can be consumed by a producer
                // that is already unwinding toward its own park, and
                // this re-signal is what wakes it again.
                inner.demand = true;
                (Poll::Pending, inner.delegate.clone())
            }
        };

        if let Some(delegate) = ready.and_then(|weak| weak.upgrade()) {
            delegate.on_consumer_ready();
        }
        result
    }

    /// Consumer-side teardown, invoked when the stream is dropped before
    /// observing end-of-stream. Signals the delegate exactly once.
    pub(crate) fn abandon(&self) {
        let delegate = {
            let mut inner = self.inner.lock();
            if inner.abandoned {
                None
            } else {
                inner.abandoned = true;
                inner.buffer.clear();
                inner.delegate.take()
            }
        };

        if let Some(delegate) = delegate.and_then(|weak| weak.upgrade()) {
            debug!("delivery stream abandoned by consumer");
            delegate.on_consumer_abandoned();
        }
    }
}

/// Producer-side handle to the delivery queue.
///
/// Created by [`channel`]; held by the polling coordinator. Pushes are
/// synchronous and never block.
pub struct QueueSource<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> QueueSource<T, E> {
    /// Pushes one element, returning the watermark accounting outcome.
    pub fn push(&self, item: Result<T, E>) -> PushOutcome {
        let (outcome, waker) = {
            let mut inner = self.shared.inner.lock();
            if inner.finished || inner.abandoned {
                return PushOutcome::Dropped;
            }
            inner.buffer.push_back(item);
            let waker = inner.waker.take();
            let outcome = if inner.buffer.len() >= inner.high_watermark {
                inner.demand = false;
                PushOutcome::Pause
            } else {
                PushOutcome::Continue
            };
            (outcome, waker)
        };

        if let Some(waker) = waker {
            waker.wake();
        }
        outcome
    }

    /// Closes the queue. Buffered elements drain to the consumer, after
    /// which it observes end-of-stream. Consumes the source, so a queue
    /// can only be finished once.
    pub fn finish(self) {
        let waker = {
            let mut inner = self.shared.inner.lock();
            inner.finished = true;
            inner.delegate = None;
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Installs the delegate receiving watermark signals.
    ///
    /// Held as a [`Weak`] so the queue does not keep its own coordinator
    /// alive.
    pub fn set_delegate(&self, delegate: Weak<dyn QueueDelegate>) {
        self.shared.inner.lock().delegate = Some(delegate);
    }
}

impl<T, E> std::fmt::Debug for QueueSource<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("QueueSource")
            .field("buffered", &inner.buffer.len())
            .field("low_watermark", &inner.low_watermark)
            .field("high_watermark", &inner.high_watermark)
            .field("finished", &inner.finished)
            .finish_non_exhaustive()
    }
}

/// Creates a watermark queue for elements of `Result<T, E>`.
///
/// Returns the producer-side [`QueueSource`] and the consumer-side
/// [`DeliveryStream`]. The stream assumes a single logical consumer;
/// watermark accounting is undefined if it is shared.
#[must_use]
pub fn channel<T, E>(
    low_watermark: usize,
    high_watermark: usize,
) -> (QueueSource<T, E>, DeliveryStream<T, E>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            buffer: VecDeque::new(),
            low_watermark,
            high_watermark,
            demand: false,
            finished: false,
            abandoned: false,
            waker: None,
            delegate: None,
        }),
    });

    let source = QueueSource {
        shared: Arc::clone(&shared),
    };
    (source, DeliveryStream::new(shared))
}
