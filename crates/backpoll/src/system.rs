//! Backpressure-aware polling coordinator.
//!
//! [`PollingSystem`] runs the poll loop that periodically invokes an
//! opaque poll function, whose side effect is to synchronously hand zero
//! or more results to [`deliver`](PollingSystem::deliver). Results flow
//! into the watermark queue, and the queue's accounting drives the loop:
//! reaching the high watermark pauses polling, consumer demand resumes
//! it, and cancellation or consumer abandonment shuts it down.
//!
//! ```text
//! poll loop ── poll() ── deliver() ── push ──► watermark queue
//!     ▲                                             │
//!     └── resume / park / shutdown ◄── StateMachine ◄── queue signals
//! ```
//!
//! All state transitions happen inside [`StateMachine`] under a single
//! short-hold mutex. The lock is never held across the poll call or
//! command execution, so the poll function may re-enter `deliver` and a
//! resumed loop may re-enter the coordinator without deadlocking. The
//! queue push in `deliver` does run under it: the push outcome and the
//! transition it maps to are applied atomically, otherwise two
//! concurrent deliveries could apply a stale `Continue` after a newer
//! `Pause`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::PollingConfig;
use crate::error::PollingError;
use crate::metrics::PollingMetrics;
use crate::state::{Command, PollLoopAction, StateMachine};
use crate::stream::DeliveryStream;
use crate::watermark::{self, PushOutcome, QueueDelegate, QueueSource};

/// Opaque poll operation. Invoked periodically by the run loop; may
/// synchronously call [`PollingSystem::deliver`] zero or more times.
pub(crate) type PollFn = Arc<dyn Fn() + Send + Sync>;

/// Coordinates a poll-driven producer with a pull-based consumer.
///
/// Created with [`create`](Self::create), which also returns the
/// consumer's [`DeliveryStream`]. The caller must set a poll function
/// via [`set_poll_fn`](Self::set_poll_fn) and then drive the system by
/// awaiting [`run`](Self::run) on a dedicated task. External shutdown is
/// requested by cancelling the token returned by
/// [`shutdown_token`](Self::shutdown_token); dropping the consumer's
/// stream shuts the system down as well. Either way the queue is
/// finished exactly once and the consumer observes a clean
/// end-of-stream.
pub struct PollingSystem<T, E> {
    /// The lifecycle state machine. Short-hold lock; besides the pure
    /// transition calls it also covers the queue push in `deliver`, so
    /// each push outcome is applied to the phase it was observed in.
    state: Mutex<StateMachine>,
    /// Ingress handle to the watermark queue. Taken (and consumed) by
    /// the first `FinishQueue`-class command, which makes the
    /// finish-exactly-once guarantee mechanical.
    source: Mutex<Option<QueueSource<T, E>>>,
    /// The user-supplied poll operation.
    poll_fn: Mutex<Option<PollFn>>,
    /// Uniform external-shutdown trigger, selected at both of the run
    /// loop's suspension points.
    shutdown: CancellationToken,
    /// Guards against the run loop being started twice.
    started: AtomicBool,
    metrics: PollingMetrics,
}

impl<T, E> PollingSystem<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a polling system and the delivery stream fed by it.
    ///
    /// The stream must be handed to the consumer; the system keeps only
    /// the queue's ingress handle. The queue signals back into the
    /// system through a weak delegate reference, so dropping both the
    /// system and the stream tears everything down.
    ///
    /// # Errors
    ///
    /// Returns [`PollingError::InvalidWatermarks`] if the configured
    /// watermark pair is unusable.
    pub fn create(
        config: PollingConfig,
    ) -> Result<(Arc<Self>, DeliveryStream<T, E>), PollingError> {
        config.validate()?;

        let (source, stream) =
            watermark::channel(config.low_watermark, config.high_watermark);

        let system = Arc::new(Self {
            state: Mutex::new(StateMachine::new()),
            source: Mutex::new(Some(source)),
            poll_fn: Mutex::new(None),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            metrics: PollingMetrics::new(),
        });

        let weak = Arc::downgrade(&system);
        let delegate: Weak<dyn QueueDelegate> = weak;
        if let Some(source) = system.source.lock().as_ref() {
            source.set_delegate(delegate);
        }

        Ok((system, stream))
    }

    /// Sets or replaces the poll function.
    ///
    /// Must be called before [`run`](Self::run); may be called again
    /// while the loop is running, taking effect from the next poll.
    pub fn set_poll_fn(&self, poll_fn: impl Fn() + Send + Sync + 'static) {
        *self.poll_fn.lock() = Some(Arc::new(poll_fn));
    }

    /// Returns a handle to the shutdown token.
    ///
    /// Cancelling it at any point is equivalent to an external shutdown
    /// request and is idempotent with a consumer-initiated termination.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns the system's metrics counters.
    #[must_use]
    pub fn metrics(&self) -> &PollingMetrics {
        &self.metrics
    }

    /// Runs the poll loop until shutdown.
    ///
    /// Polls every `poll_interval` while the consumer keeps up, parks
    /// when the queue signals the high watermark, and exits once the
    /// terminal phase is reached. Both suspension points (the timed
    /// sleep and the park) honour the shutdown token; cancellation
    /// funnels into the same terminal transition, so the queue is
    /// finished exactly once no matter which point was interrupted.
    ///
    /// # Panics
    ///
    /// Panics if called more than once, or if no poll function was set.
    pub async fn run(&self, poll_interval: Duration) {
        assert!(
            !self.started.swap(true, Ordering::SeqCst),
            "poll loop must not be started more than once"
        );
        debug!(?poll_interval, "poll loop started");

        loop {
            let action = self.state.lock().next_poll_loop_action();
            match action {
                PollLoopAction::PollAndSleep => {
                    self.invoke_poll();
                    tokio::select! {
                        () = self.shutdown.cancelled() => {
                            self.shut_down();
                            break;
                        }
                        () = tokio::time::sleep(poll_interval) => {}
                    }
                }
                PollLoopAction::SuspendPollLoop => {
                    let (waiter, resumed) = oneshot::channel();
                    self.state.lock().suspend_loop(waiter);
                    debug!("poll loop parked on high watermark");
                    tokio::select! {
                        () = self.shutdown.cancelled() => {
                            self.shut_down();
                            break;
                        }
                        _ = resumed => {}
                    }
                }
                PollLoopAction::ShutdownPollLoop => {
                    self.shut_down();
                    break;
                }
            }
        }
        debug!("poll loop exited");
    }

    /// Delivery callback, invoked by the poll operation once per
    /// resolved result.
    ///
    /// `None` models a result the native runtime failed to resolve: it
    /// is logged and dropped without touching the state machine. A
    /// resolved result is pushed into the queue and the push outcome is
    /// mapped onto a state transition; a discarded push means the
    /// backpressure accounting can no longer be trusted and shuts the
    /// system down.
    ///
    /// The push and the transition run in one critical section, so
    /// concurrent deliveries serialize.
    pub fn deliver(&self, result: Option<Result<T, E>>) {
        let Some(result) = result else {
            self.metrics.record_undeliverable();
            error!("could not resolve delivered result, dropping it");
            return;
        };

        let command = {
            let mut state = self.state.lock();
            let outcome = {
                let source = self.source.lock();
                source.as_ref().map(|source| source.push(result))
            };
            match outcome {
                Some(PushOutcome::Continue) => {
                    self.metrics.record_delivery();
                    state.produce_more()
                }
                Some(PushOutcome::Pause) => {
                    self.metrics.record_delivery();
                    self.metrics.record_pause();
                    state.stop_producing();
                    None
                }
                Some(PushOutcome::Dropped) | None => {
                    self.metrics.record_dropped();
                    debug!("push discarded by queue, shutting down");
                    state.shut_down()
                }
            }
        };
        self.execute(command);
    }

    /// Runs the terminal transition and executes its command.
    fn shut_down(&self) {
        let command = self.state.lock().shut_down();
        self.execute(command);
    }

    /// Invokes the poll function with no lock held, so it may re-enter
    /// [`deliver`](Self::deliver) synchronously.
    fn invoke_poll(&self) {
        let poll_fn = self.poll_fn.lock().clone();
        let Some(poll_fn) = poll_fn else {
            panic!("poll function must be set before the poll loop runs");
        };
        self.metrics.record_poll();
        poll_fn();
    }

    /// Executes a state machine command outside the state lock.
    fn execute(&self, command: Option<Command>) {
        match command {
            Some(Command::Resume(waiter)) => {
                self.metrics.record_resume();
                let _ = waiter.send(());
            }
            Some(Command::FinishQueue) => self.finish_source(),
            Some(Command::FinishQueueAndResume(waiter)) => {
                self.finish_source();
                let _ = waiter.send(());
            }
            None => {}
        }
    }

    /// Finishes the queue. Taking the source out of its slot makes a
    /// second finish impossible even if a second `FinishQueue`-class
    /// command were ever produced.
    fn finish_source(&self) {
        if let Some(source) = self.source.lock().take() {
            debug!("finishing delivery queue");
            source.finish();
        }
    }
}

impl<T, E> QueueDelegate for PollingSystem<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn on_consumer_ready(&self) {
        let command = self.state.lock().produce_more();
        self.execute(command);
    }

    fn on_consumer_abandoned(&self) {
        debug!("consumer abandoned the stream, shutting down");
        let command = self.state.lock().shut_down();
        self.execute(command);
    }
}

impl<T, E> std::fmt::Debug for PollingSystem<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingSystem")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    type TestSystem = PollingSystem<u64, String>;

    const INTERVAL: Duration = Duration::from_millis(1);

    /// Wires a poll function that delivers `per_poll` sequential values
    /// per invocation until `total` have been delivered.
    fn wire_counting_poll(system: &Arc<TestSystem>, per_poll: u64, total: u64) {
        let weak = Arc::downgrade(system);
        let counter = Arc::new(AtomicU64::new(0));
        system.set_poll_fn(move || {
            let Some(system) = weak.upgrade() else { return };
            for _ in 0..per_poll {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < total {
                    system.deliver(Some(Ok(n)));
                }
            }
        });
    }

    /// Routes loop tracing into the test captor. Safe to call from
    /// every test; only the first installation wins.
    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    fn spawn_loop(system: &Arc<TestSystem>) -> tokio::task::JoinHandle<()> {
        init_test_tracing();
        let system = Arc::clone(system);
        tokio::spawn(async move { system.run(INTERVAL).await })
    }

    #[test]
    fn test_create_rejects_invalid_watermarks() {
        let result = TestSystem::create(PollingConfig::new(10, 5));
        assert!(matches!(
            result,
            Err(PollingError::InvalidWatermarks { low: 10, high: 5 })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        let (system, mut stream) = TestSystem::create(PollingConfig::default()).unwrap();
        wire_counting_poll(&system, 1, 3);
        let handle = spawn_loop(&system);

        for expected in 0..3 {
            let item = timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("delivery should arrive");
            assert_eq!(item, Some(Ok(expected)));
        }

        system.shutdown_token().cancel();
        let end = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream should end after shutdown");
        assert_eq!(end, None);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit")
            .unwrap();
        assert!(system.metrics().polls.load(Ordering::Relaxed) >= 3);
        assert_eq!(system.metrics().deliveries.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_backpressure_pauses_and_resumes() {
        // Tight watermarks: every second push pauses the loop, and every
        // full drain resumes it.
        let (system, mut stream) = TestSystem::create(PollingConfig::new(1, 2)).unwrap();
        wire_counting_poll(&system, 2, 6);
        let handle = spawn_loop(&system);

        for expected in 0..6 {
            let item = timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("delivery should arrive despite pauses");
            assert_eq!(item, Some(Ok(expected)));
        }

        assert!(system.metrics().pauses.load(Ordering::Relaxed) >= 1);
        assert!(system.metrics().resumes.load(Ordering::Relaxed) >= 1);

        system.shutdown_token().cancel();
        assert_eq!(
            timeout(Duration::from_secs(1), stream.next()).await.unwrap(),
            None
        );
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_parked_finishes_queue() {
        let (system, mut stream) = TestSystem::create(PollingConfig::new(1, 2)).unwrap();
        wire_counting_poll(&system, 2, 2);
        let handle = spawn_loop(&system);

        // Wait until the loop has polled and parked on the high watermark.
        timeout(Duration::from_secs(1), async {
            while system.metrics().pauses.load(Ordering::Relaxed) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("loop should pause");

        system.shutdown_token().cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("parked loop should exit on cancellation")
            .unwrap();

        // Buffered elements drain, then the stream ends.
        assert_eq!(stream.next().await, Some(Ok(0)));
        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_drop_stream_terminates_loop() {
        let (system, stream) = TestSystem::create(PollingConfig::default()).unwrap();
        wire_counting_poll(&system, 1, 100);
        let handle = spawn_loop(&system);

        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(stream);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit once the consumer is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_cancel_and_stream_drop() {
        let (system, stream) = TestSystem::create(PollingConfig::default()).unwrap();
        wire_counting_poll(&system, 1, 100);
        let handle = spawn_loop(&system);

        tokio::time::sleep(Duration::from_millis(3)).await;
        system.shutdown_token().cancel();
        drop(stream);

        // Both shutdown paths race; the queue is still finished exactly
        // once and the loop exits cleanly.
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_deliveries_serialize() {
        // Two threads delivering into tight watermarks: the push and its
        // transition run in one critical section, so the second delivery
        // always observes the phase the first one left behind (never a
        // stale outcome, never a pause before any production).
        for _ in 0..100 {
            let (system, mut stream) = TestSystem::create(PollingConfig::new(1, 2)).unwrap();

            let first = {
                let system = Arc::clone(&system);
                tokio::task::spawn_blocking(move || system.deliver(Some(Ok(1))))
            };
            let second = {
                let system = Arc::clone(&system);
                tokio::task::spawn_blocking(move || system.deliver(Some(Ok(2))))
            };
            first.await.expect("delivery must not panic");
            second.await.expect("delivery must not panic");

            let mut got = vec![
                stream.next().await.unwrap().unwrap(),
                stream.next().await.unwrap().unwrap(),
            ];
            got.sort_unstable();
            assert_eq!(got, vec![1, 2]);
        }
    }

    #[tokio::test]
    async fn test_unresolvable_result_is_dropped() {
        let (system, mut stream) = TestSystem::create(PollingConfig::default()).unwrap();

        system.deliver(None);
        assert_eq!(system.metrics().undeliverable.load(Ordering::Relaxed), 1);

        // Nothing was queued.
        let pending = timeout(Duration::from_millis(20), stream.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_deliver_before_run_primes_production() {
        let (system, mut stream) = TestSystem::create(PollingConfig::default()).unwrap();

        system.deliver(Some(Ok(9)));
        assert_eq!(stream.next().await, Some(Ok(9)));
    }

    #[tokio::test]
    async fn test_deliver_after_shutdown_is_discarded() {
        let (system, mut stream) = TestSystem::create(PollingConfig::default()).unwrap();

        system.shutdown_token().cancel();
        wire_counting_poll(&system, 1, 0);
        system.run(INTERVAL).await;

        system.deliver(Some(Ok(1)));
        assert_eq!(system.metrics().dropped.load(Ordering::Relaxed), 1);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    #[should_panic(expected = "must not be started more than once")]
    async fn test_double_run_is_fatal() {
        let (system, _stream) = TestSystem::create(PollingConfig::default()).unwrap();
        wire_counting_poll(&system, 1, 0);

        system.shutdown_token().cancel();
        system.run(INTERVAL).await;
        system.run(INTERVAL).await;
    }

    #[tokio::test]
    #[should_panic(expected = "poll function must be set")]
    async fn test_run_without_poll_fn_is_fatal() {
        let (system, _stream) = TestSystem::create(PollingConfig::default()).unwrap();
        system.run(INTERVAL).await;
    }

    #[tokio::test]
    async fn test_error_results_reach_consumer() {
        let (system, mut stream) = TestSystem::create(PollingConfig::default()).unwrap();
        let weak = Arc::downgrade(&system);
        let delivered = Arc::new(AtomicBool::new(false));
        system.set_poll_fn(move || {
            let Some(system) = weak.upgrade() else { return };
            if !delivered.swap(true, Ordering::SeqCst) {
                system.deliver(Some(Ok(1)));
                system.deliver(Some(Err("broker down".to_string())));
            }
        });
        let handle = spawn_loop(&system);

        assert_eq!(
            timeout(Duration::from_secs(1), stream.next()).await.unwrap(),
            Some(Ok(1))
        );
        assert_eq!(
            timeout(Duration::from_secs(1), stream.next()).await.unwrap(),
            Some(Err("broker down".to_string()))
        );

        system.shutdown_token().cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
