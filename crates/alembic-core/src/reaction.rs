//! Reaction descriptors: input/output patterns, guard decomposition, and
//! the compile step that classifies inputs for the match search.
//!
//! Descriptors arrive from the (out-of-scope) front-end already decomposed:
//! the static guard carries no input variables, per-molecule conditions are
//! rolled into their input's matcher, and cross-molecule guards list the
//! sorted input positions they read. The site compiles each descriptor once
//! at activation into a [`CompiledReaction`] with the independence
//! partition and the search program precomputed.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;

use crate::molecule::MoleculeHandle;
use crate::search::{build_program, SearchOp};
use crate::value::{downcast_clone, MolData, MolValue, Value};
use alembic_sync::Pool;

/// A per-molecule condition rolled into an input's matcher.
pub type ValuePred = Arc<dyn Fn(&dyn MolData) -> bool + Send + Sync>;
/// A predicate over the tuple of values a cross guard reads.
pub type CrossPred = Arc<dyn Fn(&[&dyn MolData]) -> bool + Send + Sync>;
/// A guard with no input variables, evaluated before any molecule search.
pub type StaticGuard = Arc<dyn Fn() -> bool + Send + Sync>;

/// Per-input match rule.
#[derive(Clone)]
pub enum Matcher {
    /// Matches anything, captures nothing.
    Wildcard,
    /// Binds the value to a variable, optionally under a condition.
    SimpleVar {
        name: Option<&'static str>,
        predicate: Option<ValuePred>,
    },
    /// Matches one exact value.
    Constant(Value),
    /// An arbitrary matcher supplied by the front-end.
    Other {
        predicate: ValuePred,
        captured: Vec<&'static str>,
        irrefutable: bool,
    },
}

impl Matcher {
    pub fn matches(&self, value: &dyn MolData) -> bool {
        match self {
            Matcher::Wildcard => true,
            Matcher::SimpleVar { predicate, .. } => {
                predicate.as_ref().map_or(true, |pred| pred(value))
            }
            Matcher::Constant(constant) => constant.eq_dyn(value),
            Matcher::Other { predicate, irrefutable, .. } => *irrefutable || predicate(value),
        }
    }

    pub fn is_irrefutable(&self) -> bool {
        match self {
            Matcher::Wildcard => true,
            Matcher::SimpleVar { predicate, .. } => predicate.is_none(),
            Matcher::Constant(_) => false,
            Matcher::Other { irrefutable, .. } => *irrefutable,
        }
    }

    /// Stable precedence used for the descriptor's display ordering.
    pub fn precedence(&self) -> u8 {
        match self {
            Matcher::Constant(_) => 0,
            Matcher::SimpleVar { predicate: Some(_), .. } => 1,
            Matcher::Other { irrefutable: false, .. } => 2,
            Matcher::Other { irrefutable: true, .. } => 3,
            Matcher::SimpleVar { predicate: None, .. } => 4,
            Matcher::Wildcard => 5,
        }
    }

    pub fn captured_name(&self) -> Option<&'static str> {
        match self {
            Matcher::SimpleVar { name, .. } => *name,
            Matcher::Other { captured, .. } => captured.first().copied(),
            _ => None,
        }
    }

    /// The weaker-than relation on patterns over the same molecule: `self`
    /// is weaker than `other` iff every value matched by `other` is also
    /// matched by `self`. Unknown comparisons are not-weaker, to be safe.
    pub fn weaker_than(&self, other: &Matcher) -> bool {
        if self.is_irrefutable() {
            return true;
        }
        match (self, other) {
            (Matcher::Constant(a), Matcher::Constant(b)) => a.eq_dyn(&**b),
            // A conditional pattern compared against a known constant:
            // weaker iff the condition admits that constant.
            (Matcher::SimpleVar { predicate: Some(pred), .. }, Matcher::Constant(b))
            | (Matcher::Other { predicate: pred, irrefutable: false, .. }, Matcher::Constant(b)) => {
                pred(&**b)
            }
            _ => false,
        }
    }

    fn render(&self) -> String {
        match self {
            Matcher::Wildcard => "_".to_string(),
            Matcher::SimpleVar { name, predicate } => {
                let base = name.unwrap_or("x");
                if predicate.is_some() {
                    format!("{base}?")
                } else {
                    base.to_string()
                }
            }
            Matcher::Constant(value) => format!("={value:?}"),
            Matcher::Other { captured, irrefutable, .. } => {
                let base = captured.first().copied().unwrap_or("pat");
                if *irrefutable {
                    base.to_string()
                } else {
                    format!("{base}?")
                }
            }
        }
    }
}

/// One input of a reaction.
#[derive(Clone)]
pub struct InputDef {
    pub molecule: Arc<MoleculeHandle>,
    pub matcher: Matcher,
    /// Stable hash of the matcher source, used as the display-order
    /// tiebreaker and for identical-reaction detection.
    pub source_hash: u64,
}

impl InputDef {
    pub fn new(molecule: Arc<MoleculeHandle>, matcher: Matcher) -> InputDef {
        let source_hash = default_source_hash(&matcher);
        InputDef { molecule, matcher, source_hash }
    }

    pub fn with_source_hash(mut self, source_hash: u64) -> InputDef {
        self.source_hash = source_hash;
        self
    }

    /// Sort key for the descriptor's stable display ordering.
    fn order_key(&self) -> (String, u8, String, u64) {
        (
            self.molecule.name().to_string(),
            self.matcher.precedence(),
            self.matcher.captured_name().unwrap_or("").to_string(),
            self.source_hash,
        )
    }

    fn same_shape(&self, other: &InputDef) -> bool {
        if !Arc::ptr_eq(&self.molecule, &other.molecule) {
            return false;
        }
        match (&self.matcher, &other.matcher) {
            (Matcher::Wildcard, Matcher::Wildcard) => true,
            (
                Matcher::SimpleVar { predicate: None, .. },
                Matcher::SimpleVar { predicate: None, .. },
            ) => true,
            (Matcher::Constant(a), Matcher::Constant(b)) => a.eq_dyn(&**b),
            // Conditions cannot be compared structurally; fall back to the
            // front-end's source hash.
            _ => self.source_hash == other.source_hash,
        }
    }
}

fn default_source_hash(matcher: &Matcher) -> u64 {
    let mut hasher = FxHasher::default();
    matcher.precedence().hash(&mut hasher);
    if let Some(name) = matcher.captured_name() {
        name.hash(&mut hasher);
    }
    if let Matcher::Constant(value) = matcher {
        format!("{value:?}").hash(&mut hasher);
    }
    hasher.finish()
}

/// The syntactic environment an output emission sits inside, used by
/// shrinking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputEnv {
    /// One clause of an n-way chooser (if/match); outputs emitted in every
    /// clause of the same chooser collapse to an unconditional emission.
    ChooserBlock { id: u32, clause: u32, total: u32 },
    FuncCall,
    Lambda,
    AtLeastOneLoop,
}

#[derive(Clone)]
pub enum OutputKind {
    Constant(Value),
    Other,
}

/// One output emission of a reaction, as analyzed by the front-end.
#[derive(Clone)]
pub struct OutputDef {
    pub molecule: Arc<MoleculeHandle>,
    pub kind: OutputKind,
    /// Enclosing environments, outermost first.
    pub envs: Vec<OutputEnv>,
}

impl OutputDef {
    pub fn unconditional(molecule: Arc<MoleculeHandle>, kind: OutputKind) -> OutputDef {
        OutputDef { molecule, kind, envs: Vec::new() }
    }
}

/// Collapses chooser-conditioned outputs that are emitted in every clause
/// into unconditional ones. Equal constants survive the merge; anything
/// else becomes `Other`. Iterates to a fixpoint, so nested choosers shrink
/// level by level; `shrink(shrink(x)) == shrink(x)`.
pub fn shrink_outputs(outputs: &[OutputDef]) -> Vec<OutputDef> {
    let mut current: Vec<OutputDef> = outputs.to_vec();
    loop {
        match shrink_once(&current) {
            Some(next) => current = next,
            None => return current,
        }
    }
}

fn shrink_once(outputs: &[OutputDef]) -> Option<Vec<OutputDef>> {
    // Group candidates by (molecule, chooser id, outer envs); a group that
    // covers every clause of its chooser collapses.
    for (index, output) in outputs.iter().enumerate() {
        let Some(OutputEnv::ChooserBlock { id, total, .. }) = output.envs.last() else {
            continue;
        };
        let (id, total) = (*id, *total);
        let outer = &output.envs[..output.envs.len() - 1];

        let mut clause_members: FxHashMap<u32, usize> = FxHashMap::default();
        for (other_index, other) in outputs.iter().enumerate() {
            let Some(OutputEnv::ChooserBlock { id: oid, clause, .. }) = other.envs.last() else {
                continue;
            };
            if *oid != id
                || !Arc::ptr_eq(&other.molecule, &output.molecule)
                || &other.envs[..other.envs.len() - 1] != outer
            {
                continue;
            }
            clause_members.entry(*clause).or_insert(other_index);
        }
        if clause_members.len() as u32 != total {
            continue;
        }

        let member_indices: Vec<usize> = clause_members.values().copied().collect();
        let merged_kind = merge_kinds(member_indices.iter().map(|&i| &outputs[i].kind));
        let merged = OutputDef {
            molecule: Arc::clone(&output.molecule),
            kind: merged_kind,
            envs: outer.to_vec(),
        };

        let mut next: Vec<OutputDef> = Vec::with_capacity(outputs.len());
        for (other_index, other) in outputs.iter().enumerate() {
            if other_index == index {
                next.push(merged.clone());
            } else if !member_indices.contains(&other_index) {
                next.push(other.clone());
            }
        }
        return Some(next);
    }
    None
}

fn merge_kinds<'a>(mut kinds: impl Iterator<Item = &'a OutputKind>) -> OutputKind {
    let first = match kinds.next() {
        Some(OutputKind::Constant(value)) => value.clone(),
        _ => return OutputKind::Other,
    };
    for kind in kinds {
        match kind {
            OutputKind::Constant(value) if first.eq_dyn(&**value) => {}
            _ => return OutputKind::Other,
        }
    }
    OutputKind::Constant(first)
}

/// A guard over the values of two or more inputs of one reaction.
#[derive(Clone)]
pub struct CrossGuardDef {
    /// Input positions the guard reads, sorted ascending. The predicate
    /// receives the staged values in this order.
    pub indices: Vec<usize>,
    pub captured: Vec<&'static str>,
    pub predicate: CrossPred,
}

/// Errors a reaction body surfaces to the runtime.
pub type BodyError = Box<dyn std::error::Error + Send + Sync>;
/// A reaction body, invoked with the staged inputs.
pub type Body = Arc<dyn Fn(&mut ReactionContext) -> Result<(), BodyError> + Send + Sync>;

/// An elaborated reaction descriptor, immutable once built.
#[derive(Clone)]
pub struct ReactionDef {
    pub name: String,
    pub inputs: Vec<InputDef>,
    pub outputs: Vec<OutputDef>,
    pub static_guard: Option<StaticGuard>,
    pub cross_guards: Vec<CrossGuardDef>,
    pub body: Body,
    /// Reinject the staged inputs and reschedule if the body fails.
    pub retry: bool,
    /// Run bodies on this pool instead of the site pool.
    pub pool: Option<Pool>,
    /// Permits the same molecule to appear in several input positions;
    /// without it a repeated input is an installation error.
    pub allow_repeated: bool,
}

impl ReactionDef {
    pub fn builder(name: &str) -> ReactionBuilder {
        ReactionBuilder::new(name)
    }

    /// Input positions in the stable display order.
    fn display_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.inputs.len()).collect();
        order.sort_by_key(|&position| self.inputs[position].order_key());
        order
    }

    /// True iff `self` and `other` consume the same molecules with
    /// identically shaped matchers.
    pub fn same_inputs(&self, other: &ReactionDef) -> bool {
        if self.inputs.len() != other.inputs.len() {
            return false;
        }
        let mine = self.display_order();
        let theirs = other.display_order();
        mine.iter()
            .zip(theirs.iter())
            .all(|(&a, &b)| self.inputs[a].same_shape(&other.inputs[b]))
    }

    /// True iff every input pattern of `self` is weaker than the paired
    /// pattern of `other` over the same molecule multiset.
    pub fn weaker_than(&self, other: &ReactionDef) -> bool {
        if self.inputs.len() != other.inputs.len() {
            return false;
        }
        let mine = self.display_order();
        let theirs = other.display_order();
        for (&a, &b) in mine.iter().zip(theirs.iter()) {
            let (left, right) = (&self.inputs[a], &other.inputs[b]);
            if !Arc::ptr_eq(&left.molecule, &right.molecule) {
                return false;
            }
            if !left.matcher.weaker_than(&right.matcher) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for ReactionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .display_order()
            .into_iter()
            .map(|position| {
                let input = &self.inputs[position];
                format!("{}({})", input.molecule.name(), input.matcher.render())
            })
            .collect();
        write!(f, "{} => [{}]", rendered.join(" + "), self.name)
    }
}

impl fmt::Debug for ReactionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Builder for [`ReactionDef`]; the typed input/output sugar lives on the
/// emitters.
pub struct ReactionBuilder {
    name: String,
    inputs: Vec<InputDef>,
    outputs: Vec<OutputDef>,
    static_guard: Option<StaticGuard>,
    cross_guards: Vec<CrossGuardDef>,
    retry: bool,
    pool: Option<Pool>,
    allow_repeated: bool,
}

impl ReactionBuilder {
    pub fn new(name: &str) -> ReactionBuilder {
        ReactionBuilder {
            name: name.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            static_guard: None,
            cross_guards: Vec::new(),
            retry: false,
            pool: None,
            allow_repeated: false,
        }
    }

    /// Appends an input; its position is the next index, referenced by
    /// cross guards and by the body's staged array.
    pub fn input(mut self, input: InputDef) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: OutputDef) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn static_guard(
        mut self,
        guard: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        self.static_guard = Some(Arc::new(guard));
        self
    }

    /// Adds a guard over the values at `indices` (sorted ascending).
    pub fn cross_guard(
        mut self,
        mut indices: Vec<usize>,
        predicate: impl Fn(&[&dyn MolData]) -> bool + Send + Sync + 'static,
    ) -> Self {
        indices.sort_unstable();
        self.cross_guards.push(CrossGuardDef {
            indices,
            captured: Vec::new(),
            predicate: Arc::new(predicate),
        });
        self
    }

    pub fn retry(mut self) -> Self {
        self.retry = true;
        self
    }

    pub fn on_pool(mut self, pool: &Pool) -> Self {
        self.pool = Some(pool.clone());
        self
    }

    pub fn allow_repeated_inputs(mut self) -> Self {
        self.allow_repeated = true;
        self
    }

    pub fn body(
        self,
        body: impl Fn(&mut ReactionContext) -> Result<(), BodyError> + Send + Sync + 'static,
    ) -> ReactionDef {
        ReactionDef {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            static_guard: self.static_guard,
            cross_guards: self.cross_guards,
            body: Arc::new(body),
            retry: self.retry,
            pool: self.pool,
            allow_repeated: self.allow_repeated,
        }
    }
}

/// The staged inputs a body runs with. The body only ever sees these
/// values; bag state during the body cannot affect them.
pub struct ReactionContext {
    reaction: String,
    molecule_names: SmallVec<[String; 4]>,
    staged: SmallVec<[Option<MolValue>; 4]>,
}

impl ReactionContext {
    pub(crate) fn new(
        reaction: String,
        molecule_names: SmallVec<[String; 4]>,
        staged: SmallVec<[Option<MolValue>; 4]>,
    ) -> ReactionContext {
        ReactionContext { reaction, molecule_names, staged }
    }

    /// Clones the value of input `index` as `T`.
    ///
    /// Panics on a type mismatch; the typed emitter layer makes that a
    /// programming error, not a runtime condition.
    pub fn value<T: Any + Clone>(&self, index: usize) -> T {
        let staged = self.staged[index]
            .as_ref()
            .unwrap_or_else(|| self.already_taken(index));
        downcast_clone::<T>(staged.value()).unwrap_or_else(|| self.type_mismatch(index))
    }

    /// Moves the value of input `index` out as `T`. A retrying reaction
    /// should prefer [`value`](ReactionContext::value): taken inputs cannot
    /// be reinjected.
    pub fn take<T: Any>(&mut self, index: usize) -> T {
        let staged = self.staged[index]
            .take()
            .unwrap_or_else(|| self.already_taken(index));
        let value = match staged {
            MolValue::Plain { value, .. } | MolValue::Blocking { value, .. } => value,
        };
        match value.into_any().downcast::<T>() {
            Ok(value) => *value,
            Err(_) => self.type_mismatch(index),
        }
    }

    /// Replies to the blocking input at `index`. Returns `true` iff this
    /// reply won (first, and the emitter was still waiting).
    pub fn reply<R: Send + 'static>(&self, index: usize, value: R) -> bool {
        match self.staged[index].as_ref().and_then(MolValue::reply) {
            Some(reply) => reply.complete_erased(Box::new(value)),
            None => panic!(
                "reaction '{}': input {} ('{}') is not a blocking molecule",
                self.reaction, index, self.molecule_names[index]
            ),
        }
    }

    pub(crate) fn into_staged(self) -> SmallVec<[Option<MolValue>; 4]> {
        self.staged
    }

    fn already_taken(&self, index: usize) -> ! {
        panic!(
            "reaction '{}': input {} ('{}') was already taken",
            self.reaction, index, self.molecule_names[index]
        )
    }

    fn type_mismatch(&self, index: usize) -> ! {
        panic!(
            "reaction '{}': input {} ('{}') does not carry a value of the requested type",
            self.reaction, index, self.molecule_names[index]
        )
    }
}

/// Independent irrefutable inputs of one molecule, consumed together with
/// `take_any`.
#[derive(Debug, Clone)]
pub struct GroupedInputs {
    pub molecule: usize,
    pub positions: Vec<usize>,
}

/// A descriptor compiled against one site: molecule indices resolved,
/// inputs classified, the search program generated.
pub struct CompiledReaction {
    pub def: ReactionDef,
    /// Site molecule index per input position.
    pub input_mols: Vec<usize>,
    /// Required copies per site molecule index, sorted by molecule.
    pub required_counts: Vec<(usize, usize)>,
    /// Positions of independent inputs with a condition (never repeated).
    pub independent_conditionals: Vec<usize>,
    /// Independent irrefutable inputs grouped by molecule.
    pub grouped: Vec<GroupedInputs>,
    /// Positions staged by the search program.
    pub cross_positions: Vec<usize>,
    pub program: Vec<SearchOp>,
    /// Outputs after chooser shrinking, for static-molecule analysis.
    pub shrunk_outputs: Vec<OutputDef>,
}

impl CompiledReaction {
    /// Classifies inputs and generates the search program. `mol_index`
    /// maps each input's molecule handle to its site index.
    pub fn compile(def: ReactionDef, mol_index: &FxHashMap<usize, usize>) -> CompiledReaction {
        let input_mols: Vec<usize> = def
            .inputs
            .iter()
            .map(|input| mol_index[&MoleculeHandle::key(&input.molecule)])
            .collect();

        let mut required: FxHashMap<usize, usize> = FxHashMap::default();
        for &molecule in &input_mols {
            *required.entry(molecule).or_insert(0) += 1;
        }
        let mut required_counts: Vec<(usize, usize)> = required.iter().map(|(&m, &c)| (m, c)).collect();
        required_counts.sort_unstable();

        let in_cross: Vec<bool> = (0..def.inputs.len())
            .map(|position| {
                def.cross_guards
                    .iter()
                    .any(|guard| guard.indices.contains(&position))
            })
            .collect();

        let mut independent_conditionals = Vec::new();
        let mut grouped: Vec<GroupedInputs> = Vec::new();
        let mut cross_positions = Vec::new();

        for (position, input) in def.inputs.iter().enumerate() {
            let molecule = input_mols[position];
            let occurrences: Vec<usize> = (0..def.inputs.len())
                .filter(|&other| input_mols[other] == molecule)
                .collect();
            let repeated = occurrences.len() > 1;
            let any_occurrence_cross = occurrences.iter().any(|&other| in_cross[other]);
            let all_irrefutable = occurrences
                .iter()
                .all(|&other| def.inputs[other].matcher.is_irrefutable());

            let independent = !any_occurrence_cross && (!repeated || all_irrefutable);
            if !independent {
                cross_positions.push(position);
            } else if input.matcher.is_irrefutable() {
                match grouped.iter_mut().find(|group| group.molecule == molecule) {
                    Some(group) => group.positions.push(position),
                    None => grouped.push(GroupedInputs { molecule, positions: vec![position] }),
                }
            } else {
                independent_conditionals.push(position);
            }
        }

        let program = build_program(&def, &input_mols, &cross_positions);
        let shrunk_outputs = shrink_outputs(&def.outputs);

        CompiledReaction {
            def,
            input_mols,
            required_counts,
            independent_conditionals,
            grouped,
            cross_positions,
            program,
            shrunk_outputs,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecule::MoleculeHandle;
    use std::any::TypeId;

    fn mol(name: &str) -> Arc<MoleculeHandle> {
        MoleculeHandle::new(name, TypeId::of::<i64>(), true, false, false)
    }

    fn pred(f: impl Fn(&dyn MolData) -> bool + Send + Sync + 'static) -> ValuePred {
        Arc::new(f)
    }

    #[test]
    fn irrefutable_matchers_are_weaker_than_anything() {
        let constant = Matcher::Constant(Box::new(3i64));
        assert!(Matcher::Wildcard.weaker_than(&constant));
        assert!(Matcher::SimpleVar { name: Some("x"), predicate: None }.weaker_than(&constant));
        assert!(
            Matcher::Other {
                predicate: pred(|_| true),
                captured: vec![],
                irrefutable: true
            }
            .weaker_than(&Matcher::Wildcard)
        );
    }

    #[test]
    fn constants_compare_by_value() {
        let three = Matcher::Constant(Box::new(3i64));
        let also_three = Matcher::Constant(Box::new(3i64));
        let four = Matcher::Constant(Box::new(4i64));
        assert!(three.weaker_than(&also_three));
        assert!(!three.weaker_than(&four));
        assert!(!three.weaker_than(&Matcher::Wildcard));
    }

    #[test]
    fn conditional_vs_constant_applies_the_predicate() {
        let positive = Matcher::SimpleVar {
            name: Some("n"),
            predicate: Some(pred(|v| {
                v.as_any().downcast_ref::<i64>().is_some_and(|n| *n > 0)
            })),
        };
        assert!(positive.weaker_than(&Matcher::Constant(Box::new(5i64))));
        assert!(!positive.weaker_than(&Matcher::Constant(Box::new(-5i64))));
    }

    #[test]
    fn shrink_collapses_full_choosers() {
        let a = mol("a");
        let in_clause = |clause| OutputDef {
            molecule: Arc::clone(&a),
            kind: OutputKind::Constant(Box::new(1i64)),
            envs: vec![OutputEnv::ChooserBlock { id: 0, clause, total: 2 }],
        };
        let shrunk = shrink_outputs(&[in_clause(0), in_clause(1)]);
        assert_eq!(shrunk.len(), 1);
        assert!(shrunk[0].envs.is_empty());
        assert!(matches!(&shrunk[0].kind, OutputKind::Constant(v) if v.eq_dyn(&1i64)));
    }

    #[test]
    fn shrink_merges_unequal_constants_to_other() {
        let a = mol("a");
        let output = |clause, value: i64| OutputDef {
            molecule: Arc::clone(&a),
            kind: OutputKind::Constant(Box::new(value)),
            envs: vec![OutputEnv::ChooserBlock { id: 0, clause, total: 2 }],
        };
        let shrunk = shrink_outputs(&[output(0, 1), output(1, 2)]);
        assert_eq!(shrunk.len(), 1);
        assert!(matches!(shrunk[0].kind, OutputKind::Other));
    }

    #[test]
    fn shrink_keeps_partial_choosers() {
        let a = mol("a");
        let only_clause_zero = OutputDef {
            molecule: a,
            kind: OutputKind::Other,
            envs: vec![OutputEnv::ChooserBlock { id: 0, clause: 0, total: 2 }],
        };
        let shrunk = shrink_outputs(&[only_clause_zero.clone()]);
        assert_eq!(shrunk.len(), 1);
        assert_eq!(shrunk[0].envs, only_clause_zero.envs);
    }

    #[test]
    fn shrink_is_idempotent() {
        let a = mol("a");
        let outputs: Vec<OutputDef> = (0..3)
            .map(|clause| OutputDef {
                molecule: Arc::clone(&a),
                kind: OutputKind::Other,
                envs: vec![OutputEnv::ChooserBlock { id: 7, clause, total: 3 }],
            })
            .collect();
        let once = shrink_outputs(&outputs);
        let twice = shrink_outputs(&once);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.envs, b.envs);
        }
    }

    #[test]
    fn display_orders_inputs_stably() {
        let b = mol("b");
        let a = mol("a");
        let def = ReactionDef::builder("sum")
            .input(InputDef::new(b, Matcher::Wildcard))
            .input(InputDef::new(a, Matcher::SimpleVar { name: Some("n"), predicate: None }))
            .body(|_| Ok(()));
        assert_eq!(def.to_string(), "a(n) + b(_) => [sum]");
    }
}
