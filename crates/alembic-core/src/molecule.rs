//! The untyped core of a molecule emitter.
//!
//! Typed emitters ([`crate::emitter`]) are thin wrappers around an
//! `Arc<MoleculeHandle>`: the handle carries the molecule's identity and,
//! once a site adopts it, the binding that routes emissions.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::error::ChemError;
use crate::site::ReactionSite;

/// Where a molecule is bound, fixed exactly once at site activation.
pub struct Binding {
    pub site: Arc<ReactionSite>,
    /// Index of this molecule's bag at the site.
    pub index: usize,
    /// Whether the site classified this molecule as pipelined.
    pub pipelined: bool,
    /// Names of the reactions consuming this molecule, for diagnostics.
    pub consuming_reactions: Vec<String>,
}

/// Identity and binding state of one molecule kind.
pub struct MoleculeHandle {
    name: String,
    type_id: TypeId,
    /// Whether the payload type is simple enough for a counted bag.
    simple: bool,
    blocking: bool,
    is_static: bool,
    binding: OnceCell<Binding>,
}

impl MoleculeHandle {
    pub fn new(
        name: &str,
        type_id: TypeId,
        simple: bool,
        blocking: bool,
        is_static: bool,
    ) -> Arc<MoleculeHandle> {
        Arc::new(MoleculeHandle {
            name: name.to_string(),
            type_id,
            simple,
            blocking,
            is_static,
            binding: OnceCell::new(),
        })
    }

    /// Identity key of a handle, used to map handles to site indices.
    pub fn key(this: &Arc<MoleculeHandle>) -> usize {
        Arc::as_ptr(this) as usize
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is_simple(&self) -> bool {
        self.simple
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn is_bound(&self) -> bool {
        self.binding.get().is_some()
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.get()
    }

    /// The binding, or the "not bound" error every emitter operation
    /// raises before a site adopts the molecule.
    pub fn bound(&self) -> Result<&Binding, ChemError> {
        self.binding
            .get()
            .ok_or_else(|| ChemError::MoleculeNotBound(self.name.clone()))
    }

    /// Adopts the molecule into a site. Fails if some site already did.
    pub(crate) fn bind(&self, binding: Binding) -> Result<(), ChemError> {
        let site_name = binding.site.name().to_string();
        self.binding.set(binding).map_err(|_| ChemError::AlreadyBound {
            molecule: self.name.clone(),
            site: self
                .binding
                .get()
                .map(|bound| bound.site.name().to_string())
                .unwrap_or(site_name),
        })
    }
}

impl fmt::Debug for MoleculeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("MoleculeHandle");
        dbg.field("name", &self.name)
            .field("blocking", &self.blocking)
            .field("static", &self.is_static);
        if let Some(binding) = self.binding.get() {
            dbg.field("site", &binding.site.name())
                .field("index", &binding.index)
                .field("pipelined", &binding.pipelined);
        } else {
            dbg.field("bound", &false);
        }
        dbg.finish()
    }
}
