//! Poll-loop state machine.
//!
//! [`StateMachine`] is a pure transition table for the polling system's
//! lifecycle. Every transition is synchronous, performs no I/O, and is
//! invoked under the coordinator's lock. Transitions that require an
//! effect (resuming the parked loop, finishing the delivery queue)
//! return a [`Command`] for the coordinator to execute after releasing
//! the lock, so a resumed task can re-enter the coordinator without
//! deadlocking.

use tokio::sync::oneshot;

/// Wake handle for the parked poll-loop task.
///
/// Sending `()` (or dropping the sender) resumes the loop, which then
/// re-reads [`StateMachine::next_poll_loop_action`].
pub(crate) type Waiter = oneshot::Sender<()>;

/// Discrete lifecycle phase of the polling system.
///
/// Transitions are monotonic toward [`Finished`](Phase::Finished) except
/// for the `Producing ⇄ Paused` oscillation driven by the delivery
/// queue's watermark accounting.
#[derive(Debug)]
pub(crate) enum Phase {
    /// No poll has occurred yet.
    Initial,
    /// The poll loop is actively polling and pushing results.
    Producing,
    /// The queue asked production to stop. The waiter is present once
    /// the loop has actually parked itself, and absent while it is
    /// still unwinding toward suspension.
    Paused(Option<Waiter>),
    /// Terminal. No further polling; the queue has been finished.
    Finished,
}

/// Next step for the poll loop, derived from the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollLoopAction {
    /// Invoke the poll function, then sleep for the poll interval.
    PollAndSleep,
    /// Park the loop until production is allowed again.
    SuspendPollLoop,
    /// Finish the queue and exit the loop.
    ShutdownPollLoop,
}

/// Effect to be executed by the coordinator outside the state lock.
#[derive(Debug)]
pub(crate) enum Command {
    /// Resume the parked poll loop.
    Resume(Waiter),
    /// Finish the delivery queue.
    FinishQueue,
    /// Finish the delivery queue, then wake the parked loop so it can
    /// observe [`Phase::Finished`] and exit.
    FinishQueueAndResume(Waiter),
}

/// The polling system's state machine.
#[derive(Debug)]
pub(crate) struct StateMachine {
    phase: Phase,
}

impl StateMachine {
    /// Creates a state machine in [`Phase::Initial`].
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Initial,
        }
    }

    /// Returns the next action for the poll loop.
    pub(crate) fn next_poll_loop_action(&self) -> PollLoopAction {
        match self.phase {
            Phase::Initial | Phase::Producing => PollLoopAction::PollAndSleep,
            // Production was stopped but the loop is still running;
            // direct it to park itself.
            Phase::Paused(_) => PollLoopAction::SuspendPollLoop,
            Phase::Finished => PollLoopAction::ShutdownPollLoop,
        }
    }

    /// The consumer side allowed production to continue.
    ///
    /// From `Paused` this returns [`Command::Resume`] if the loop has
    /// already parked. From `Initial` it primes the machine to
    /// `Producing` with nothing to resume — the queue may legitimately
    /// request production before the loop's first poll.
    pub(crate) fn produce_more(&mut self) -> Option<Command> {
        match &mut self.phase {
            Phase::Producing | Phase::Finished => None,
            Phase::Initial => {
                self.phase = Phase::Producing;
                None
            }
            Phase::Paused(waiter) => {
                let waiter = waiter.take();
                self.phase = Phase::Producing;
                waiter.map(Command::Resume)
            }
        }
    }

    /// The consumer side asked production to stop.
    ///
    /// Idempotent in `Paused` and a no-op in `Finished`.
    ///
    /// # Panics
    ///
    /// Panics in `Initial`: a stop signal before any production started
    /// is a protocol violation by the queue.
    pub(crate) fn stop_producing(&mut self) {
        match self.phase {
            Phase::Paused(_) | Phase::Finished => {}
            Phase::Initial => {
                panic!("stop_producing signalled before any production started")
            }
            Phase::Producing => self.phase = Phase::Paused(None),
        }
    }

    /// Records the poll loop's wake handle right before it parks.
    ///
    /// If a stop signal arrived concurrently with the loop's decision to
    /// suspend, the phase may still be `Initial` or `Producing`; the
    /// waiter is recorded by transitioning to `Paused` directly. In
    /// `Finished` the waiter is dropped, which wakes the loop so it can
    /// observe the terminal phase and exit.
    ///
    /// # Panics
    ///
    /// Panics if a waiter is already recorded: the poll loop was started
    /// more than once.
    pub(crate) fn suspend_loop(&mut self, waiter: Waiter) {
        match self.phase {
            Phase::Finished => {}
            Phase::Paused(Some(_)) => {
                panic!("poll loop suspended more than once")
            }
            Phase::Initial | Phase::Producing | Phase::Paused(None) => {
                self.phase = Phase::Paused(Some(waiter));
            }
        }
    }

    /// Terminal transition to [`Phase::Finished`]. Idempotent.
    ///
    /// Returns a `FinishQueue`-class command on the first call only, so
    /// the queue is finished exactly once across any call history. If
    /// the loop is parked, the command also carries its waiter so the
    /// loop is never left parked after `Finished`.
    pub(crate) fn shut_down(&mut self) -> Option<Command> {
        match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Finished => None,
            Phase::Initial | Phase::Producing => Some(Command::FinishQueue),
            Phase::Paused(Some(waiter)) => Some(Command::FinishQueueAndResume(waiter)),
            Phase::Paused(None) => Some(Command::FinishQueue),
        }
    }

    /// Returns `true` once the terminal phase has been reached.
    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished)
    }
}
