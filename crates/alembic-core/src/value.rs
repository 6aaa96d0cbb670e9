//! Type-erased molecule data.
//!
//! Emitters are typed; the soup is not. Every molecule value crosses into
//! the engine as a `Box<dyn MolData>`, which carries enough dynamic
//! behavior (equality, hashing, cloning, debug) for the counted bags and
//! the constant matchers to work without knowing the concrete type.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use alembic_sync::PromiseSetter;

/// Dynamic behavior required of a molecule payload.
///
/// Blanket-implemented for every `T: Any + Send + Clone + Eq + Hash + Debug`,
/// so user code never implements it by hand.
pub trait MolData: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn eq_dyn(&self, other: &dyn MolData) -> bool;
    fn hash_dyn(&self, state: &mut dyn Hasher);
    fn clone_dyn(&self) -> Box<dyn MolData>;
    fn debug_dyn(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T> MolData for T
where
    T: Any + Send + Clone + Eq + Hash + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn eq_dyn(&self, other: &dyn MolData) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }

    fn hash_dyn(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }

    fn clone_dyn(&self) -> Box<dyn MolData> {
        Box::new(self.clone())
    }

    fn debug_dyn(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An erased molecule payload.
pub type Value = Box<dyn MolData>;

impl fmt::Debug for dyn MolData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.debug_dyn(f)
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        self.clone_dyn()
    }
}

/// Hashable/comparable wrapper so erased values can key the counted bags.
#[derive(Debug, Clone)]
pub struct DynKey(pub Value);

impl PartialEq for DynKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_dyn(&*other.0)
    }
}

impl Eq for DynKey {}

impl Hash for DynKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_dyn(state);
    }
}

/// Type-erased producer end of a reply channel, carried inside a blocking
/// molecule value. The typed side lives in the emitter layer.
pub trait ErasedReply: Send + Sync {
    /// Delivers a reply value. Returns `false` if the value's type does not
    /// match the channel, the emitter timed out, or a reply already won.
    fn complete_erased(&self, value: Box<dyn Any + Send>) -> bool;
    /// Resolves the channel with a "no reply" error.
    fn fail(&self, reason: &str) -> bool;
    /// True iff no reply or failure was ever attempted.
    fn has_no_reply_attempted(&self) -> bool;
    /// True iff the emitter stopped waiting; such values are dropped
    /// instead of staged.
    fn is_abandoned(&self) -> bool;
}

/// Shared handle to the erased reply endpoint of one blocking emission.
pub type ReplyStub = Arc<dyn ErasedReply>;

/// A datum present in the soup, tagged with its provenance.
pub enum MolValue {
    /// Emitted by a non-blocking emitter. `notify` backs
    /// `emit_until_consumed` and fires when a reaction consumes this copy.
    Plain {
        value: Value,
        notify: Option<PromiseSetter<()>>,
    },
    /// Emitted by a blocking emitter; carries the reply endpoint the
    /// reaction body must resolve.
    Blocking { value: Value, reply: ReplyStub },
}

impl MolValue {
    pub fn plain(value: Value) -> MolValue {
        MolValue::Plain { value, notify: None }
    }

    pub fn value(&self) -> &dyn MolData {
        match self {
            MolValue::Plain { value, .. } | MolValue::Blocking { value, .. } => &**value,
        }
    }

    pub fn reply(&self) -> Option<&ReplyStub> {
        match self {
            MolValue::Plain { .. } => None,
            MolValue::Blocking { reply, .. } => Some(reply),
        }
    }

    /// True iff this is a blocking value whose emitter gave up waiting.
    pub fn is_abandoned(&self) -> bool {
        self.reply().map_or(false, |reply| reply.is_abandoned())
    }

    /// Fires the consumption notification, if any. Called exactly once,
    /// when the value is removed from its bag for a staged reaction.
    pub fn notify_consumed(&mut self) {
        if let MolValue::Plain { notify, .. } = self {
            if let Some(notify) = notify.take() {
                notify.set(());
            }
        }
    }
}

impl fmt::Debug for MolValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MolValue::Plain { value, .. } => write!(f, "{value:?}"),
            MolValue::Blocking { value, .. } => write!(f, "{value:?}/B"),
        }
    }
}

/// Whether values of this type belong in a counted bag even when the
/// molecule is not pipelined: unit, booleans, scalar integers, chars and
/// string-likes all hash cheaply and compare by value.
pub fn is_simple_type(type_id: TypeId) -> bool {
    type_id == TypeId::of::<()>()
        || type_id == TypeId::of::<bool>()
        || type_id == TypeId::of::<char>()
        || type_id == TypeId::of::<i8>()
        || type_id == TypeId::of::<i16>()
        || type_id == TypeId::of::<i32>()
        || type_id == TypeId::of::<i64>()
        || type_id == TypeId::of::<i128>()
        || type_id == TypeId::of::<isize>()
        || type_id == TypeId::of::<u8>()
        || type_id == TypeId::of::<u16>()
        || type_id == TypeId::of::<u32>()
        || type_id == TypeId::of::<u64>()
        || type_id == TypeId::of::<u128>()
        || type_id == TypeId::of::<usize>()
        || type_id == TypeId::of::<String>()
        || type_id == TypeId::of::<&'static str>()
}

/// Clones a typed view out of an erased value. `None` on type mismatch.
pub fn downcast_clone<T: Any + Clone>(value: &dyn MolData) -> Option<T> {
    value.as_any().downcast_ref::<T>().cloned()
}
