//! Concurrency substrate for the alembic chemical-machine runtime.
//!
//! This crate provides the three primitives the reaction-site engine is
//! built on:
//!
//! - [`promise`]: a one-shot value slot used for observation futures.
//! - [`reply_channel`]: the single-shot rendezvous carrying the reply to a
//!   blocking emission, with a timeout that races cleanly against the
//!   replying side.
//! - [`Pool`]: a two-queue executor pair. A single scheduler thread
//!   serializes all match-search decisions for the sites bound to it, while
//!   a bounded worker group runs reaction bodies. Blocking-elastic pools
//!   grow their worker target by one around every announced blocking call
//!   so a body waiting on another molecule of the same site cannot starve
//!   the reaction that would unblock it.
//!
//! None of these types know anything about molecules or reactions; the
//! engine lives in `alembic-core`.

mod pool;
mod promise;
mod reply;

pub use pool::{Pool, PoolKind};
pub use promise::{promise, PromiseHandle, PromiseSetter};
pub use reply::{reply_channel, ReplyError, ReplyFuture, ReplyReceiver, ReplySender};
