//! Structured runtime events.
//!
//! The core reports what happened; how the events are rendered or shipped
//! is the embedder's business. The default [`LogReporter`] forwards to the
//! `log` facade.

use parking_lot::Mutex;

/// One structured event from a reaction site or its scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteEvent {
    /// A site was installed and bound to a pool's scheduler.
    SchedulerAssigned { site: String, pool: String },
    /// A reaction was matched and its body handed to a worker pool.
    ReactionScheduled { site: String, reaction: String, trigger: String },
    ReactionStarted { reaction: String },
    ReactionFinished { reaction: String },
    /// A body failed or panicked.
    ReactionException { reaction: String, message: String, retried: bool },
    /// A body finished without replying to a blocking input.
    ReplyNeverSent { reaction: String, molecule: String },
    /// An emitted value failed every per-molecule condition of a pipelined
    /// molecule and was dropped.
    PipelinedEmissionRefused { site: String, molecule: String },
    /// Install-time analysis found an unavoidable-indeterminism pair.
    LivelockDetected { site: String, detail: String },
    /// A body consumed a static molecule and re-emitted it a number of
    /// times other than one.
    StaticViolation { reaction: String, molecule: String, emitted: usize },
}

/// Receiver of site events.
pub trait Reporter: Send + Sync {
    fn report(&self, event: SiteEvent);
}

/// Default reporter: forwards events to the `log` facade.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: SiteEvent) {
        match &event {
            SiteEvent::SchedulerAssigned { site, pool } => {
                log::debug!("site '{site}' assigned to scheduler of pool '{pool}'");
            }
            SiteEvent::ReactionScheduled { site, reaction, trigger } => {
                log::trace!("site '{site}': scheduled '{reaction}' (trigger '{trigger}')");
            }
            SiteEvent::ReactionStarted { reaction } => {
                log::trace!("reaction '{reaction}' started");
            }
            SiteEvent::ReactionFinished { reaction } => {
                log::trace!("reaction '{reaction}' finished");
            }
            SiteEvent::ReactionException { reaction, message, retried } => {
                log::error!("reaction '{reaction}' failed (retried={retried}): {message}");
            }
            SiteEvent::ReplyNeverSent { reaction, molecule } => {
                log::error!("reaction '{reaction}' finished without replying to '{molecule}'");
            }
            SiteEvent::PipelinedEmissionRefused { site, molecule } => {
                log::debug!("site '{site}': refused pipelined emission of '{molecule}'");
            }
            SiteEvent::LivelockDetected { site, detail } => {
                log::warn!("site '{site}': livelock detected: {detail}");
            }
            SiteEvent::StaticViolation { reaction, molecule, emitted } => {
                log::error!(
                    "reaction '{reaction}' re-emitted static molecule '{molecule}' {emitted} times (expected exactly once)"
                );
            }
        }
    }
}

/// Discards every event.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _event: SiteEvent) {}
}

/// Records events for assertions in tests.
#[derive(Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<SiteEvent>>,
}

impl CollectingReporter {
    pub fn new() -> CollectingReporter {
        CollectingReporter::default()
    }

    pub fn events(&self) -> Vec<SiteEvent> {
        self.events.lock().clone()
    }

    pub fn contains(&self, pred: impl Fn(&SiteEvent) -> bool) -> bool {
        self.events.lock().iter().any(pred)
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, event: SiteEvent) {
        self.events.lock().push(event);
    }
}
