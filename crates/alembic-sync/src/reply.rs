//! Single-shot rendezvous between one blocking emitter and one reacting
//! worker.
//!
//! The emitter side waits (optionally with a timeout) for the reacting side
//! to call [`ReplySender::complete`]. The state transitions are guarded by
//! one mutex so that a timeout and a concurrent reply race cleanly: exactly
//! one of them observes success.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Failure delivered to a blocking emitter instead of a reply value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    /// The reaction body finished (or died) without replying.
    #[error("blocking molecule received no reply: {0}")]
    NoReply(String),
}

enum ReplyState<R> {
    /// No reply yet; the emitter may still be waiting.
    Empty,
    /// A reply value is parked, waiting for the emitter to pick it up.
    Replied(R),
    /// The emitter took the value.
    Taken,
    /// The emitter stopped waiting; any later reply is discarded.
    TimedOut,
    /// The reacting side resolved the channel with an error.
    Failed(String),
}

struct ReplyCore<R> {
    state: Mutex<ReplyState<R>>,
    signal: Condvar,
    /// Set by every `complete`/`fail` call, including ones that lose the
    /// race against a timeout. Lets the site distinguish "body never tried
    /// to reply" from "reply arrived too late".
    attempted: AtomicBool,
}

/// Producer end, held (via the staged input array) by the reaction body.
pub struct ReplySender<R> {
    core: Arc<ReplyCore<R>>,
}

/// Consumer end, held by the blocking emitter.
pub struct ReplyReceiver<R> {
    core: Arc<ReplyCore<R>>,
}

/// Future-style end backed by the same slot as the blocking wait.
pub struct ReplyFuture<R> {
    core: Arc<ReplyCore<R>>,
}

/// Creates a connected sender/receiver pair for one blocking emission.
pub fn reply_channel<R: Send>() -> (ReplySender<R>, ReplyReceiver<R>) {
    let core = Arc::new(ReplyCore {
        state: Mutex::new(ReplyState::Empty),
        signal: Condvar::new(),
        attempted: AtomicBool::new(false),
    });
    (
        ReplySender { core: Arc::clone(&core) },
        ReplyReceiver { core },
    )
}

impl<R: Send> ReplySender<R> {
    /// Delivers the reply. Returns `true` iff this was the first completion
    /// and the emitter had not already timed out.
    pub fn complete(&self, value: R) -> bool {
        self.core.attempted.store(true, Ordering::Release);
        let mut state = self.core.state.lock();
        match *state {
            ReplyState::Empty => {
                *state = ReplyState::Replied(value);
                self.core.signal.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Resolves the channel with a "no reply" error. Returns `true` iff the
    /// emitter had not already received a reply or timed out.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.core.attempted.store(true, Ordering::Release);
        let mut state = self.core.state.lock();
        match *state {
            ReplyState::Empty => {
                *state = ReplyState::Failed(reason.into());
                self.core.signal.notify_all();
                true
            }
            _ => false,
        }
    }

    /// True iff no `complete` or `fail` was ever attempted on this channel.
    pub fn has_no_reply_attempted(&self) -> bool {
        !self.core.attempted.load(Ordering::Acquire)
    }

    /// True iff the emitter gave up waiting. The site drops such stale
    /// blocking values instead of staging them.
    pub fn is_abandoned(&self) -> bool {
        matches!(*self.core.state.lock(), ReplyState::TimedOut)
    }
}

impl<R: Send> ReplyReceiver<R> {
    /// Blocks until the reply arrives or the channel is failed.
    pub fn await_reply(self) -> Result<R, ReplyError> {
        let mut state = self.core.state.lock();
        loop {
            match &*state {
                ReplyState::Empty => self.core.signal.wait(&mut state),
                _ => return resolve(&mut state),
            }
        }
    }

    /// Blocks up to `timeout`. On expiry the state atomically becomes
    /// `TimedOut`, so a reply racing with the deadline loses cleanly and
    /// the caller gets `Ok(None)`.
    pub fn await_timeout(self, timeout: Duration) -> Result<Option<R>, ReplyError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.core.state.lock();
        loop {
            match &*state {
                ReplyState::Empty => {
                    if self.core.signal.wait_until(&mut state, deadline).timed_out() {
                        if matches!(*state, ReplyState::Empty) {
                            *state = ReplyState::TimedOut;
                            return Ok(None);
                        }
                        // A reply slipped in between the wakeup and the
                        // re-lock; fall through and take it.
                    }
                }
                _ => return resolve(&mut state).map(Some),
            }
        }
    }

    /// Converts the blocking end into a future-style handle resolved by the
    /// same completion.
    pub fn into_future(self) -> ReplyFuture<R> {
        ReplyFuture { core: self.core }
    }
}

impl<R: Send> ReplyFuture<R> {
    /// Whether a reply or failure has already been recorded.
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.core.state.lock(), ReplyState::Empty)
    }

    /// Blocks until resolution; same semantics as [`ReplyReceiver::await_reply`].
    pub fn wait(self) -> Result<R, ReplyError> {
        ReplyReceiver { core: self.core }.await_reply()
    }

    /// Blocks up to `timeout`; same semantics as [`ReplyReceiver::await_timeout`].
    pub fn wait_timeout(self, timeout: Duration) -> Result<Option<R>, ReplyError> {
        ReplyReceiver { core: self.core }.await_timeout(timeout)
    }
}

/// Takes the terminal value out of a non-`Empty` state.
fn resolve<R>(state: &mut ReplyState<R>) -> Result<R, ReplyError> {
    match mem::replace(state, ReplyState::Taken) {
        ReplyState::Replied(value) => Ok(value),
        ReplyState::Failed(reason) => {
            *state = ReplyState::Failed(reason.clone());
            Err(ReplyError::NoReply(reason))
        }
        ReplyState::TimedOut => {
            *state = ReplyState::TimedOut;
            Err(ReplyError::NoReply("reply channel already timed out".into()))
        }
        ReplyState::Taken => Err(ReplyError::NoReply("reply already consumed".into())),
        ReplyState::Empty => unreachable!("resolve called on empty reply state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn complete_then_await() {
        let (tx, rx) = reply_channel();
        assert!(tx.complete(42));
        assert_eq!(rx.await_reply().unwrap(), 42);
    }

    #[test]
    fn await_blocks_until_complete() {
        let (tx, rx) = reply_channel();
        let waiter = thread::spawn(move || rx.await_reply());
        thread::sleep(Duration::from_millis(20));
        assert!(tx.has_no_reply_attempted());
        assert!(tx.complete("hello"));
        assert_eq!(waiter.join().unwrap().unwrap(), "hello");
    }

    #[test]
    fn second_complete_loses() {
        let (tx, rx) = reply_channel();
        assert!(tx.complete(1));
        assert!(!tx.complete(2));
        assert_eq!(rx.await_reply().unwrap(), 1);
    }

    #[test]
    fn timeout_wins_over_late_reply() {
        let (tx, rx) = reply_channel::<u32>();
        assert_eq!(rx.await_timeout(Duration::from_millis(20)).unwrap(), None);
        assert!(!tx.complete(5));
        assert!(tx.is_abandoned());
        assert!(!tx.has_no_reply_attempted());
    }

    #[test]
    fn fail_unblocks_with_error() {
        let (tx, rx) = reply_channel::<u32>();
        let waiter = thread::spawn(move || rx.await_reply());
        thread::sleep(Duration::from_millis(10));
        assert!(tx.fail("reaction died"));
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err, ReplyError::NoReply("reaction died".into()));
    }

    #[test]
    fn future_end_sees_completion() {
        let (tx, rx) = reply_channel();
        let future = rx.into_future();
        assert!(!future.is_resolved());
        assert!(tx.complete(9));
        assert!(future.is_resolved());
        assert_eq!(future.wait().unwrap(), 9);
    }

    #[test]
    fn timed_await_gets_early_reply() {
        let (tx, rx) = reply_channel();
        let waiter = thread::spawn(move || rx.await_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        assert!(tx.complete(3));
        assert_eq!(waiter.join().unwrap().unwrap(), Some(3));
    }
}
