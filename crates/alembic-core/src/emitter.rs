//! Typed molecule emitters.
//!
//! An emitter is the user's handle to one molecule kind: created unbound,
//! adopted by exactly one reaction site at installation, callable for the
//! rest of the process life. [`Emitter`] covers non-blocking molecules;
//! [`BlockingEmitter`] adds the emit-and-wait protocol over a reply
//! channel. Both also provide the typed sugar for building input and
//! output patterns, so the untyped descriptor layer never leaks into user
//! code.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ChemError;
use crate::molecule::MoleculeHandle;
use crate::reaction::{InputDef, Matcher, OutputDef, OutputEnv, OutputKind, ValuePred};
use crate::site::SiteBuilder;
use crate::value::{downcast_clone, is_simple_type, ErasedReply, MolData, MolValue, ReplyStub};
use alembic_sync::{promise, reply_channel, Pool, PromiseHandle, ReplyError, ReplyFuture, ReplySender};

/// Everything a molecule payload must be. Blanket-implemented; user types
/// only need the usual derives.
pub trait Molecule: Any + Send + Clone + Eq + Hash + fmt::Debug {}

impl<T: Any + Send + Clone + Eq + Hash + fmt::Debug> Molecule for T {}

/// Handle to a non-blocking molecule carrying values of type `T`.
pub struct Emitter<T> {
    pub(crate) handle: Arc<MoleculeHandle>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Emitter { handle: Arc::clone(&self.handle), _marker: PhantomData }
    }
}

impl<T: Molecule> Emitter<T> {
    /// Creates an unbound emitter. It becomes usable once a site with a
    /// reaction consuming this molecule is installed.
    pub fn new(name: &str) -> Emitter<T> {
        Emitter {
            handle: MoleculeHandle::new(
                name,
                TypeId::of::<T>(),
                is_simple_type(TypeId::of::<T>()),
                false,
                false,
            ),
            _marker: PhantomData,
        }
    }

    /// Creates an unbound static molecule emitter. The site installation
    /// must declare its initial value with [`SiteBuilder::with_static`].
    pub fn new_static(name: &str) -> Emitter<T> {
        Emitter {
            handle: MoleculeHandle::new(
                name,
                TypeId::of::<T>(),
                is_simple_type(TypeId::of::<T>()),
                false,
                true,
            ),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_bound()
    }

    /// Whether the site classified this molecule as pipelined. `false`
    /// while unbound.
    pub fn is_pipelined(&self) -> bool {
        self.handle.binding().map_or(false, |binding| binding.pipelined)
    }

    /// Emits one copy of `value` into the soup.
    pub fn emit(&self, value: T) -> Result<(), ChemError> {
        let binding = self.handle.bound()?;
        binding.site.emit(binding.index, MolValue::plain(Box::new(value)))
    }

    /// Emits `value` and returns a promise resolved when a reaction
    /// consumes that particular copy.
    pub fn emit_until_consumed(&self, value: T) -> Result<PromiseHandle<()>, ChemError> {
        let binding = self.handle.bound()?;
        let (setter, handle) = promise();
        binding.site.emit(
            binding.index,
            MolValue::Plain { value: Box::new(value), notify: Some(setter) },
        )?;
        Ok(handle)
    }

    /// A promise resolved at the next emission of this molecule.
    pub fn when_emitted(&self) -> Result<PromiseHandle<()>, ChemError> {
        let binding = self.handle.bound()?;
        Ok(binding.site.when_emitted(binding.index))
    }

    /// A promise resolved at the end of the next scheduling pass of this
    /// molecule's site: the trigger molecule's name if a reaction was
    /// dispatched, `None` otherwise.
    pub fn when_scheduled(&self) -> Result<PromiseHandle<Option<String>>, ChemError> {
        let binding = self.handle.bound()?;
        Ok(binding.site.when_scheduled(binding.index))
    }

    /// The last emitted value of a static molecule, read without consuming
    /// it.
    pub fn volatile_value(&self) -> Result<T, ChemError> {
        let binding = self.handle.bound()?;
        let value = binding.site.volatile_value(binding.index)?;
        downcast_clone::<T>(&*value)
            .ok_or_else(|| ChemError::TypeMismatch { molecule: self.name().to_string() })
    }

    /// Debug rendering of this molecule's site soup. Returns a sentinel
    /// string when called from a reaction thread.
    pub fn log_soup(&self) -> String {
        match self.handle.binding() {
            Some(binding) => binding.site.log_soup(),
            None => format!("<molecule '{}' is not bound to any site>", self.name()),
        }
    }

    // --- input pattern sugar ---

    /// `m(_)`: consume one copy, ignore the value.
    pub fn wildcard(&self) -> InputDef {
        InputDef::new(Arc::clone(&self.handle), Matcher::Wildcard)
    }

    /// `m(x)`: consume one copy, bind the value.
    pub fn var(&self, name: &'static str) -> InputDef {
        InputDef::new(
            Arc::clone(&self.handle),
            Matcher::SimpleVar { name: Some(name), predicate: None },
        )
    }

    /// `m(x if cond)`: consume one copy whose value satisfies `cond`.
    pub fn var_if(
        &self,
        name: &'static str,
        cond: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> InputDef {
        InputDef::new(
            Arc::clone(&self.handle),
            Matcher::SimpleVar { name: Some(name), predicate: Some(typed_pred(cond)) },
        )
    }

    /// `m(=v)`: consume one copy equal to `value`.
    pub fn constant(&self, value: T) -> InputDef {
        InputDef::new(Arc::clone(&self.handle), Matcher::Constant(Box::new(value)))
    }

    // --- output pattern sugar (static analysis only) ---

    /// Declares that the reaction emits this molecule with a value known
    /// at compile time.
    pub fn output_const(&self, value: T) -> OutputDef {
        OutputDef::unconditional(
            Arc::clone(&self.handle),
            OutputKind::Constant(Box::new(value)),
        )
    }

    /// Declares that the reaction emits this molecule with a computed
    /// value.
    pub fn output(&self) -> OutputDef {
        OutputDef::unconditional(Arc::clone(&self.handle), OutputKind::Other)
    }

    /// Declares an emission inside one clause of a chooser.
    pub fn output_in_clause(&self, id: u32, clause: u32, total: u32) -> OutputDef {
        OutputDef {
            molecule: Arc::clone(&self.handle),
            kind: OutputKind::Other,
            envs: vec![OutputEnv::ChooserBlock { id, clause, total }],
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Emitter({:?})", self.handle)
    }
}

/// Handle to a blocking molecule carrying `T` and replying with `R`.
pub struct BlockingEmitter<T, R> {
    pub(crate) handle: Arc<MoleculeHandle>,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R> Clone for BlockingEmitter<T, R> {
    fn clone(&self) -> Self {
        BlockingEmitter { handle: Arc::clone(&self.handle), _marker: PhantomData }
    }
}

impl<T: Molecule, R: Send + 'static> BlockingEmitter<T, R> {
    pub fn new(name: &str) -> BlockingEmitter<T, R> {
        BlockingEmitter {
            handle: MoleculeHandle::new(
                name,
                TypeId::of::<T>(),
                is_simple_type(TypeId::of::<T>()),
                true,
                false,
            ),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_bound()
    }

    /// Emits `value` and blocks until a reaction replies. Errors if the
    /// consuming body never replies.
    pub fn request(&self, value: T) -> Result<R, ChemError> {
        let (receiver, announce) = self.emit_blocking(value)?;
        let result = announce.around(|| receiver.await_reply());
        result.map_err(|error| self.no_reply(error))
    }

    /// Emits `value` and blocks up to `timeout`. `Ok(None)` on expiry; a
    /// reply racing the deadline is discarded and the stale soup value is
    /// dropped by the site.
    pub fn request_timeout(&self, value: T, timeout: Duration) -> Result<Option<R>, ChemError> {
        let (receiver, announce) = self.emit_blocking(value)?;
        let result = announce.around(|| receiver.await_timeout(timeout));
        result.map_err(|error| self.no_reply(error))
    }

    /// Emits `value` and returns the future end of the reply channel
    /// without blocking.
    pub fn future_reply(&self, value: T) -> Result<ReplyFuture<R>, ChemError> {
        let binding = self.handle.bound()?;
        let (sender, receiver) = reply_channel::<R>();
        let reply: ReplyStub = Arc::new(TypedReplyStub { sender });
        binding
            .site
            .emit(binding.index, MolValue::Blocking { value: Box::new(value), reply })?;
        Ok(receiver.into_future())
    }

    fn emit_blocking(
        &self,
        value: T,
    ) -> Result<(alembic_sync::ReplyReceiver<R>, BlockingAnnouncement), ChemError> {
        let binding = self.handle.bound()?;
        let (sender, receiver) = reply_channel::<R>();
        let reply: ReplyStub = Arc::new(TypedReplyStub { sender });
        binding
            .site
            .emit(binding.index, MolValue::Blocking { value: Box::new(value), reply })?;

        // If the emitting thread is a pool worker, announce the wait so a
        // blocking-elastic pool can keep serving the site meanwhile.
        let current = Pool::current();
        let self_blocking = current
            .as_ref()
            .map_or(false, |pool| pool.same_pool(binding.site.pool()));
        Ok((receiver, BlockingAnnouncement { pool: current, self_blocking }))
    }

    fn no_reply(&self, error: ReplyError) -> ChemError {
        let ReplyError::NoReply(cause) = error;
        ChemError::NoReply { molecule: self.name().to_string(), cause }
    }

    // --- input pattern sugar ---

    pub fn wildcard(&self) -> InputDef {
        InputDef::new(Arc::clone(&self.handle), Matcher::Wildcard)
    }

    pub fn var(&self, name: &'static str) -> InputDef {
        InputDef::new(
            Arc::clone(&self.handle),
            Matcher::SimpleVar { name: Some(name), predicate: None },
        )
    }

    pub fn var_if(
        &self,
        name: &'static str,
        cond: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> InputDef {
        InputDef::new(
            Arc::clone(&self.handle),
            Matcher::SimpleVar { name: Some(name), predicate: Some(typed_pred(cond)) },
        )
    }

    pub fn constant(&self, value: T) -> InputDef {
        InputDef::new(Arc::clone(&self.handle), Matcher::Constant(Box::new(value)))
    }
}

impl<T, R> fmt::Debug for BlockingEmitter<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockingEmitter({:?})", self.handle)
    }
}

/// Wraps a typed condition into the erased predicate the matchers use.
fn typed_pred<T: Molecule>(
    cond: impl Fn(&T) -> bool + Send + Sync + 'static,
) -> ValuePred {
    Arc::new(move |value: &dyn MolData| {
        value.as_any().downcast_ref::<T>().map_or(false, |value| cond(value))
    })
}

/// Scope guard for the started/finished blocking-call announcements.
struct BlockingAnnouncement {
    pool: Option<Pool>,
    self_blocking: bool,
}

impl BlockingAnnouncement {
    fn around<V>(&self, wait: impl FnOnce() -> V) -> V {
        if let Some(pool) = &self.pool {
            pool.started_blocking_call(self.self_blocking);
        }
        let value = wait();
        if let Some(pool) = &self.pool {
            pool.finished_blocking_call(self.self_blocking);
        }
        value
    }
}

/// The typed side of a blocking molecule's reply endpoint.
struct TypedReplyStub<R: Send + 'static> {
    sender: ReplySender<R>,
}

impl<R: Send + 'static> ErasedReply for TypedReplyStub<R> {
    fn complete_erased(&self, value: Box<dyn Any + Send>) -> bool {
        match value.downcast::<R>() {
            Ok(value) => self.sender.complete(*value),
            Err(_) => false,
        }
    }

    fn fail(&self, reason: &str) -> bool {
        self.sender.fail(reason)
    }

    fn has_no_reply_attempted(&self) -> bool {
        self.sender.has_no_reply_attempted()
    }

    fn is_abandoned(&self) -> bool {
        self.sender.is_abandoned()
    }
}

impl SiteBuilder {
    /// Declares a static molecule with its single initial value.
    pub fn with_static<T: Molecule>(self, emitter: &Emitter<T>, value: T) -> SiteBuilder {
        self.static_value(&emitter.handle, Box::new(value))
    }
}
