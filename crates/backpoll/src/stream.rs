//! Consumer-facing delivery stream.
//!
//! [`DeliveryStream`] adapts the watermark queue's pull interface to a
//! lazy asynchronous sequence of `Result<T, E>`: one element per
//! [`next`](DeliveryStream::next) call, `None` once the producer side has
//! finished and the buffer drained. It also implements
//! `tokio_stream::Stream`, so the usual combinators (`.map()`,
//! `.take()`, `.collect()`) apply.
//!
//! The stream assumes a single logical consumer — it is not `Clone`, and
//! the queue's watermark accounting is undefined if elements are pulled
//! from more than one task. Dropping the stream before end-of-stream
//! signals the producer side that the consumer abandoned iteration.
//!
//! Wakeups are edge-triggered through the queue's stored waker; the
//! consumer task is only woken when an element arrives or the queue is
//! finished, never busy-polled.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio_stream::Stream;

use crate::watermark::Shared;

/// Pull-based asynchronous sequence of delivered results.
///
/// Created by [`channel`](crate::watermark::channel) or, wired to a
/// running poll loop, by [`PollingSystem::create`](crate::PollingSystem::create).
pub struct DeliveryStream<T, E> {
    shared: Arc<Shared<T, E>>,
    /// Set once `None` has been observed; suppresses the abandon signal
    /// on drop after a clean end.
    terminated: bool,
}

impl<T, E> DeliveryStream<T, E> {
    pub(crate) fn new(shared: Arc<Shared<T, E>>) -> Self {
        Self {
            shared,
            terminated: false,
        }
    }

    /// Returns the next delivered result, suspending the caller until an
    /// element is available or the producer side finishes.
    ///
    /// Returns `None` once the queue is finished and drained; every
    /// subsequent call returns `None` as well.
    pub async fn next(&mut self) -> Option<Result<T, E>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Returns `true` once end-of-stream has been observed.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl<T, E> Stream for DeliveryStream<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // All fields are Unpin, so get_mut is safe.
        let this = self.get_mut();

        if this.terminated {
            return Poll::Ready(None);
        }

        match this.shared.poll_next(cx) {
            Poll::Ready(None) => {
                this.terminated = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<T, E> Drop for DeliveryStream<T, E> {
    fn drop(&mut self) {
        if !self.terminated {
            self.shared.abandon();
        }
    }
}

impl<T, E> std::fmt::Debug for DeliveryStream<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStream")
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}
