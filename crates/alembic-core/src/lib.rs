//! alembic-core: a chemical-machine (join calculus) runtime.
//!
//! Programs declare typed, named *molecules* and *reactions* over them. A
//! [`ReactionSite`] holds the multiset of emitted values ("the soup");
//! whenever some combination of present molecules matches a reaction's
//! input patterns and its guards hold, the site atomically removes those
//! molecules and dispatches the reaction body on a worker pool. Bodies may
//! compute, emit further molecules, and reply to blocking emitters.
//!
//! # Architecture
//!
//! - [`Emitter`] / [`BlockingEmitter`]: typed user handles, bound to one
//!   site at installation.
//! - [`bag`]: per-molecule multisets, counted or queue-ordered.
//! - [`reaction`]: elaborated descriptors with decomposed guards, compiled
//!   at activation into an independence partition plus a search program.
//! - [`search`]: the `ChooseMol` / `ConstrainGuard` / `CloseGroup` DSL
//!   backtracking over cross-constrained inputs.
//! - [`site`]: emission, the scheduling pass, atomic consumption, dispatch
//!   and static-molecule bookkeeping.
//!
//! # Threading
//!
//! Each site serializes its decisions on its pool's single scheduler
//! thread; bodies run on worker threads and never hold the site lock.
//! Blocking emitters announce their waits so blocking-elastic pools can
//! grow past them (see `alembic_sync::Pool`).
//!
//! # Example
//!
//! ```no_run
//! use alembic_core::{Emitter, ReactionDef, SiteBuilder};
//! use alembic_sync::Pool;
//!
//! let pool = Pool::fixed_cpu("main");
//! let counter = Emitter::<i64>::new("counter");
//! let incr = Emitter::<()>::new("incr");
//!
//! let site = SiteBuilder::new("counting", &pool)
//!     .reaction(
//!         ReactionDef::builder("increment")
//!             .input(counter.var("n"))
//!             .input(incr.wildcard())
//!             .output(counter.output())
//!             .body({
//!                 let counter = counter.clone();
//!                 move |ctx| {
//!                     let n: i64 = ctx.value(0);
//!                     counter.emit(n + 1)?;
//!                     Ok(())
//!                 }
//!             }),
//!     )
//!     .install()
//!     .expect("install failed");
//!
//! counter.emit(0).unwrap();
//! incr.emit(()).unwrap();
//! # let _ = site;
//! ```

pub mod bag;
pub mod emitter;
pub mod error;
pub mod molecule;
pub mod reaction;
pub mod reporter;
pub mod search;
pub mod site;
pub mod value;

pub use emitter::{BlockingEmitter, Emitter, Molecule};
pub use error::ChemError;
pub use reaction::{
    BodyError, CrossGuardDef, InputDef, Matcher, OutputDef, OutputEnv, OutputKind,
    ReactionBuilder, ReactionContext, ReactionDef,
};
pub use reporter::{CollectingReporter, LogReporter, NullReporter, Reporter, SiteEvent};
pub use site::{ReactionSite, SiteBuilder};
pub use value::{downcast_clone, MolData, MolValue};

pub use alembic_sync::{Pool, PoolKind, PromiseHandle, ReplyFuture};
