//! The reaction site: owner of the bags for a coherent group of reactions
//! and of every scheduling decision over them.
//!
//! All bag mutation happens under the site's one lock, taken either by an
//! emitter (to add a value) or by a scheduling pass running on the site
//! pool's scheduler thread (to search and consume). Reaction bodies run on
//! worker threads and never hold the lock.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::bag::{MoleculeBag, Pick};
use crate::error::ChemError;
use crate::molecule::{Binding, MoleculeHandle};
use crate::reaction::{
    Body, CompiledReaction, Matcher, OutputDef, ReactionContext, ReactionDef,
};
use crate::reporter::{LogReporter, Reporter, SiteEvent};
use crate::search::run_search;
use crate::value::{is_simple_type, MolValue, ReplyStub, Value};
use alembic_sync::{promise, Pool, PromiseHandle, PromiseSetter};

/// Per-thread record of the reaction currently running on this thread,
/// carrying the statics it consumed. Installed around every body by the
/// dispatch path; emitters consult it to police static emission and to
/// refuse `log_soup` from reaction threads.
struct ReactionScope {
    site: usize,
    reaction: String,
    /// Site molecule indices of the statics this reaction consumed, with
    /// the number of times the body has re-emitted each so far.
    static_emitted: FxHashMap<usize, usize>,
}

thread_local! {
    static REACTION_SCOPE: RefCell<Option<ReactionScope>> = const { RefCell::new(None) };
}

/// Per-molecule bookkeeping of one site.
struct MoleculeInfo {
    handle: Arc<MoleculeHandle>,
    pipelined: bool,
    is_static: bool,
    /// Matchers of the consuming occurrences, for the pipelined emit-time
    /// admission test. `None` means some consumer is unconditional, so
    /// every value is admitted.
    admit: Option<Vec<Matcher>>,
    /// Mirror of the last emitted value of a static molecule, readable
    /// without consuming it.
    volatile: Option<Value>,
    when_emitted: Vec<PromiseSetter<()>>,
}

/// Mutable state of a site, all under one lock.
struct SiteState {
    molecules: Vec<MoleculeInfo>,
    bags: Vec<MoleculeBag>,
    reactions: Vec<CompiledReaction>,
    rng: SmallRng,
    /// Observation promises resolved at the end of the next scheduling
    /// pass: the trigger molecule's name if a reaction was dispatched,
    /// `None` otherwise.
    when_scheduled: Vec<PromiseSetter<Option<String>>>,
}

/// A reaction site. Alive for process life (emitters hold it); shut down
/// implicitly when its pool shuts down.
pub struct ReactionSite {
    name: String,
    pool: Pool,
    reporter: Arc<dyn Reporter>,
    state: Mutex<SiteState>,
    /// Mailbox of trigger molecule indices, drained by scheduling passes.
    triggers: SegQueue<usize>,
    /// Self-handle so `&self` methods can hand the site to closures.
    me: Weak<ReactionSite>,
}

impl std::fmt::Debug for ReactionSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactionSite").field("name", &self.name).finish()
    }
}

/// A found match: one pick per conditional/cross input position; grouped
/// positions are consumed separately with `take_any`.
struct Staging {
    picks: Vec<Option<Pick>>,
}

/// Everything a worker needs to run one dispatched reaction, collected
/// under the site lock and moved out of it.
struct DispatchPlan {
    site: Arc<ReactionSite>,
    reaction_name: String,
    body: Body,
    retry: bool,
    pool: Pool,
    input_mols: Vec<usize>,
    molecule_names: SmallVec<[String; 4]>,
    static_inputs: Vec<usize>,
    staged: SmallVec<[Option<MolValue>; 4]>,
    replies: Vec<(usize, String, ReplyStub)>,
}

impl ReactionSite {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn arc(&self) -> Arc<ReactionSite> {
        self.me.upgrade().expect("reaction site dropped while in use")
    }

    fn identity(&self) -> usize {
        self as *const ReactionSite as usize
    }

    /// True on a thread currently running a reaction body.
    pub fn on_reaction_thread() -> bool {
        REACTION_SCOPE.with(|slot| slot.borrow().is_some())
    }

    /// Adds a value to the soup and queues a scheduling pass.
    pub fn emit(&self, index: usize, value: MolValue) -> Result<(), ChemError> {
        if self.pool.is_shutdown() {
            return Err(ChemError::SiteInactive(self.name.clone()));
        }

        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let info = &mut state.molecules[index];

            if info.is_static {
                self.check_static_emission(index, info.handle.name())?;
                info.volatile = Some(value.value().clone_dyn());
            }

            // Pipelined admission: a value failing every per-molecule
            // condition across consuming reactions can never react, so it
            // is refused at emit time instead of stored. Statics are
            // exempt; losing a static copy would wedge the site.
            if info.pipelined && !info.is_static {
                if let Some(admit) = &info.admit {
                    if !admit.iter().any(|matcher| matcher.matches(value.value())) {
                        if let Some(reply) = value.reply() {
                            reply.fail("emission refused: value fails every input condition");
                        }
                        self.reporter.report(SiteEvent::PipelinedEmissionRefused {
                            site: self.name.clone(),
                            molecule: info.handle.name().to_string(),
                        });
                        return Ok(());
                    }
                }
            }

            for setter in info.when_emitted.drain(..) {
                setter.set(());
            }
            state.bags[index].add(value);
        }

        self.schedule(index);
        Ok(())
    }

    /// Queues a scheduling pass on the pool's scheduler thread.
    fn schedule(&self, trigger: usize) {
        self.triggers.push(trigger);
        let site = self.arc();
        self.pool.run_scheduler(move || site.scheduling_pass());
    }

    /// One pass of the scheduler: dispatch eligible reactions until none
    /// remains, then resolve the observation promises.
    fn scheduling_pass(&self) {
        let mut trigger_name: Option<String> = None;
        while let Some(trigger) = self.triggers.pop() {
            if trigger_name.is_none() {
                let state = self.state.lock();
                trigger_name = Some(state.molecules[trigger].handle.name().to_string());
            }
        }

        let mut dispatched = false;
        while let Some(plan) = self.try_dispatch_once(trigger_name.as_deref()) {
            dispatched = true;
            let pool = plan.pool.clone();
            let name = plan.reaction_name.clone();
            pool.run_reaction(&name, move || plan.run());
        }

        let pending: Vec<PromiseSetter<Option<String>>> = {
            let mut state = self.state.lock();
            state.when_scheduled.drain(..).collect()
        };
        for setter in pending {
            setter.set(if dispatched { trigger_name.clone() } else { None });
        }
    }

    /// Finds one runnable reaction, consumes its inputs under the lock,
    /// and returns the dispatch plan. `None` when nothing is runnable.
    fn try_dispatch_once(&self, trigger: Option<&str>) -> Option<DispatchPlan> {
        let mut state_guard = self.state.lock();
        let state = &mut *state_guard;

        for bag in &mut state.bags {
            let dropped = bag.purge_abandoned();
            if dropped > 0 {
                log::debug!(
                    "site '{}': dropped {dropped} abandoned blocking value(s)",
                    self.name
                );
            }
        }

        // Every eligible reaction must win with equal probability.
        let mut order: Vec<usize> = (0..state.reactions.len()).collect();
        order.shuffle(&mut state.rng);

        for index in order {
            let Some(staging) = try_stage(&state.reactions[index], &state.molecules, &state.bags)
            else {
                continue;
            };

            let reaction = &state.reactions[index];
            let staged = consume(&mut state.bags, reaction, staging);

            let molecule_names: SmallVec<[String; 4]> = reaction
                .input_mols
                .iter()
                .map(|&m| state.molecules[m].handle.name().to_string())
                .collect();
            let mut static_inputs: Vec<usize> = reaction
                .input_mols
                .iter()
                .copied()
                .filter(|&m| state.molecules[m].is_static)
                .collect();
            static_inputs.dedup();
            let replies: Vec<(usize, String, ReplyStub)> = staged
                .iter()
                .enumerate()
                .filter_map(|(position, value)| {
                    value.as_ref().and_then(MolValue::reply).map(|reply| {
                        (position, molecule_names[position].clone(), Arc::clone(reply))
                    })
                })
                .collect();

            let plan = DispatchPlan {
                site: self.arc(),
                reaction_name: reaction.def.name.clone(),
                body: Arc::clone(&reaction.def.body),
                retry: reaction.def.retry,
                pool: reaction.def.pool.clone().unwrap_or_else(|| self.pool.clone()),
                input_mols: reaction.input_mols.clone(),
                molecule_names,
                static_inputs,
                staged,
                replies,
            };

            self.reporter.report(SiteEvent::ReactionScheduled {
                site: self.name.clone(),
                reaction: plan.reaction_name.clone(),
                trigger: trigger.unwrap_or("<reinjection>").to_string(),
            });
            return Some(plan);
        }
        None
    }

    /// Puts the unconsumed staged values of a failed `retry` reaction back
    /// into their bags and queues another pass.
    fn reinject(&self, input_mols: &[usize], staged: SmallVec<[Option<MolValue>; 4]>) {
        {
            let mut state = self.state.lock();
            for (position, value) in staged.into_iter().enumerate() {
                if let Some(value) = value {
                    state.bags[input_mols[position]].add(value);
                }
            }
        }
        if let Some(&first) = input_mols.first() {
            self.schedule(first);
        }
    }

    /// Enforces that a static molecule is only emitted by the body that
    /// consumed it, and at most once.
    fn check_static_emission(&self, index: usize, molecule: &str) -> Result<(), ChemError> {
        let site_key = self.identity();
        REACTION_SCOPE.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_mut() {
                Some(scope) if scope.site == site_key => {
                    match scope.static_emitted.get_mut(&index) {
                        Some(emitted) if *emitted == 0 => {
                            *emitted = 1;
                            Ok(())
                        }
                        Some(_) => Err(ChemError::StaticMisuse(format!(
                            "reaction '{}' emitted static molecule '{molecule}' more than once",
                            scope.reaction
                        ))),
                        None => Err(ChemError::StaticMisuse(format!(
                            "reaction '{}' emits static molecule '{molecule}' without consuming it",
                            scope.reaction
                        ))),
                    }
                }
                _ => Err(ChemError::StaticMisuse(format!(
                    "static molecule '{molecule}' can only be emitted by a reaction that consumed it"
                ))),
            }
        })
    }

    /// Initial emission of a static molecule during installation; exempt
    /// from the consuming-reaction rule.
    fn emit_initial(&self, index: usize, value: MolValue) {
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            state.molecules[index].volatile = Some(value.value().clone_dyn());
            state.bags[index].add(value);
        }
        self.schedule(index);
    }

    /// The volatile mirror of a static molecule's value.
    pub fn volatile_value(&self, index: usize) -> Result<Value, ChemError> {
        let state = self.state.lock();
        let info = &state.molecules[index];
        if !info.is_static {
            return Err(ChemError::StaticMisuse(format!(
                "molecule '{}' is not static; only static molecules are volatile-readable",
                info.handle.name()
            )));
        }
        info.volatile.clone().ok_or_else(|| {
            ChemError::StaticMisuse(format!(
                "static molecule '{}' has not been emitted yet",
                info.handle.name()
            ))
        })
    }

    /// A promise resolved at the next emission of this molecule.
    pub fn when_emitted(&self, index: usize) -> PromiseHandle<()> {
        let (setter, handle) = promise();
        self.state.lock().molecules[index].when_emitted.push(setter);
        handle
    }

    /// A promise resolved at the end of the next scheduling pass with the
    /// trigger molecule's name if a reaction was dispatched.
    pub fn when_scheduled(&self, _index: usize) -> PromiseHandle<Option<String>> {
        let (setter, handle) = promise();
        self.state.lock().when_scheduled.push(setter);
        handle
    }

    /// Debug rendering of the soup. Forbidden from reaction threads, where
    /// it returns a sentinel instead of deadlocking against a body that
    /// holds staged values.
    pub fn log_soup(&self) -> String {
        if Self::on_reaction_thread() {
            return format!("<site '{}': soup unavailable inside a reaction>", self.name);
        }
        let state = self.state.lock();
        let mut parts: Vec<String> = Vec::with_capacity(state.molecules.len());
        for (info, bag) in state.molecules.iter().zip(state.bags.iter()) {
            if bag.is_empty() {
                continue;
            }
            parts.push(format!(
                "{}/{}[{}]",
                info.handle.name(),
                bag.len(),
                bag.values_debug()
            ));
        }
        if parts.is_empty() {
            format!("site '{}': <empty>", self.name)
        } else {
            format!("site '{}': {}", self.name, parts.join(", "))
        }
    }
}

/// Attempts to stage one full input set for a reaction without mutating
/// the bags.
fn try_stage(
    reaction: &CompiledReaction,
    molecules: &[MoleculeInfo],
    bags: &[MoleculeBag],
) -> Option<Staging> {
    for &(molecule, required) in &reaction.required_counts {
        if bags[molecule].len() < required {
            return None;
        }
    }

    if let Some(guard) = &reaction.def.static_guard {
        if !guard() {
            return None;
        }
    }

    let mut picks: Vec<Option<Pick>> = vec![None; reaction.def.inputs.len()];

    for &position in &reaction.independent_conditionals {
        let molecule = reaction.input_mols[position];
        let matcher = &reaction.def.inputs[position].matcher;
        let pick = if molecules[molecule].pipelined {
            // Pipelined molecules expose only their head value; a failing
            // head means the molecule counts as absent.
            let head = bags[molecule].head()?;
            let admissible = bags[molecule]
                .value_of(&head)
                .map_or(false, |value| matcher.matches(value));
            if !admissible {
                return None;
            }
            head
        } else {
            bags[molecule].find(|value| matcher.matches(value))?
        };
        picks[position] = Some(pick);
    }

    // Grouped irrefutable inputs need no staging: the count check above
    // guarantees `take_any` will succeed at consumption.

    if !run_search(reaction, bags, &mut picks) {
        return None;
    }
    Some(Staging { picks })
}

/// Removes every staged copy from its bag. Runs under the site lock, so
/// the multiset decreases exactly by the reaction's input multiset before
/// anything else observes the soup.
fn consume(
    bags: &mut [MoleculeBag],
    reaction: &CompiledReaction,
    staging: Staging,
) -> SmallVec<[Option<MolValue>; 4]> {
    let mut staged: SmallVec<[Option<MolValue>; 4]> =
        (0..reaction.def.inputs.len()).map(|_| None).collect();

    for (position, pick) in staging.picks.into_iter().enumerate() {
        if let Some(pick) = pick {
            let value = bags[reaction.input_mols[position]]
                .remove_pick(&pick)
                .expect("staged pick vanished under the site lock");
            staged[position] = Some(value);
        }
    }

    for group in &reaction.grouped {
        let taken = bags[group.molecule].take_any(group.positions.len());
        assert_eq!(
            taken.len(),
            group.positions.len(),
            "bag undercount under the site lock"
        );
        for (&position, value) in group.positions.iter().zip(taken) {
            staged[position] = Some(value);
        }
    }
    staged
}

impl DispatchPlan {
    /// Runs the reaction body on a worker thread, then settles replies,
    /// verifies static re-emission, and handles failure/retry.
    fn run(self) {
        let DispatchPlan {
            site,
            reaction_name,
            body,
            retry,
            pool: _,
            input_mols,
            molecule_names,
            static_inputs,
            staged,
            replies,
        } = self;

        site.reporter
            .report(SiteEvent::ReactionStarted { reaction: reaction_name.clone() });

        let scope = ReactionScope {
            site: site.identity(),
            reaction: reaction_name.clone(),
            static_emitted: static_inputs.iter().map(|&m| (m, 0)).collect(),
        };
        REACTION_SCOPE.with(|slot| *slot.borrow_mut() = Some(scope));

        let mut ctx = ReactionContext::new(reaction_name.clone(), molecule_names, staged);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&mut ctx)));

        let scope = REACTION_SCOPE
            .with(|slot| slot.borrow_mut().take())
            .expect("reaction scope vanished during the body");

        let failure: Option<String> = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(payload) => Some(panic_message(&*payload)),
        };

        // Reply discipline: a body that exits without replying resolves the
        // channel with a "no reply" error so the emitter unblocks. A failed
        // `retry` body keeps its channels open: the staged blocking values
        // go back into the bags for another attempt.
        let will_retry = retry && failure.is_some();
        for (_, molecule, reply) in &replies {
            if will_retry {
                break;
            }
            if reply.has_no_reply_attempted() {
                let cause = failure.clone().unwrap_or_else(|| {
                    format!("reaction '{reaction_name}' finished without replying")
                });
                reply.fail(&cause);
                site.reporter.report(SiteEvent::ReplyNeverSent {
                    reaction: reaction_name.clone(),
                    molecule: molecule.clone(),
                });
            }
        }

        match failure {
            None => {
                for (&molecule, &emitted) in &scope.static_emitted {
                    if emitted != 1 {
                        let name = {
                            let state = site.state.lock();
                            state.molecules[molecule].handle.name().to_string()
                        };
                        site.reporter.report(SiteEvent::StaticViolation {
                            reaction: reaction_name.clone(),
                            molecule: name,
                            emitted,
                        });
                    }
                }
                site.reporter
                    .report(SiteEvent::ReactionFinished { reaction: reaction_name });
            }
            Some(message) => {
                site.reporter.report(SiteEvent::ReactionException {
                    reaction: reaction_name,
                    message,
                    retried: retry,
                });
                if retry {
                    site.reinject(&input_mols, ctx.into_staged());
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "reaction body panicked".to_string()
    }
}

/// Builder for a reaction site; [`install`](SiteBuilder::install) performs
/// the static checks and activates the site.
pub struct SiteBuilder {
    name: String,
    pool: Pool,
    reporter: Arc<dyn Reporter>,
    reactions: Vec<ReactionDef>,
    statics: Vec<(Arc<MoleculeHandle>, Value)>,
    seed: Option<u64>,
}

impl SiteBuilder {
    pub fn new(name: &str, pool: &Pool) -> SiteBuilder {
        SiteBuilder {
            name: name.to_string(),
            pool: pool.clone(),
            reporter: Arc::new(LogReporter),
            reactions: Vec::new(),
            statics: Vec::new(),
            seed: None,
        }
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Seeds the site RNG for deterministic tests. The API still promises
    /// no ordering.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn reaction(mut self, reaction: ReactionDef) -> Self {
        self.reactions.push(reaction);
        self
    }

    /// Declares a static molecule with its single initial value. The typed
    /// sugar for this lives on the emitters.
    pub fn static_value(mut self, handle: &Arc<MoleculeHandle>, value: Value) -> Self {
        self.statics.push((Arc::clone(handle), value));
        self
    }

    /// Runs the install-time checks, activates the site, binds the
    /// emitters, and emits the initial statics.
    pub fn install(self) -> Result<Arc<ReactionSite>, ChemError> {
        let SiteBuilder { name, pool, reporter, reactions, statics, seed } = self;

        // Molecule indices, in order of first appearance across inputs.
        let mut mol_index: FxHashMap<usize, usize> = FxHashMap::default();
        let mut handles: Vec<Arc<MoleculeHandle>> = Vec::new();
        for reaction in &reactions {
            for input in &reaction.inputs {
                let key = MoleculeHandle::key(&input.molecule);
                if !mol_index.contains_key(&key) {
                    mol_index.insert(key, handles.len());
                    handles.push(Arc::clone(&input.molecule));
                }
            }
        }

        for handle in &handles {
            if let Some(binding) = handle.binding() {
                return Err(ChemError::AlreadyBound {
                    molecule: handle.name().to_string(),
                    site: binding.site.name().to_string(),
                });
            }
        }

        for reaction in &reactions {
            if reaction.inputs.is_empty() {
                return Err(ChemError::NoInputs(reaction.name.clone()));
            }
        }

        for reaction in &reactions {
            if reaction.allow_repeated {
                continue;
            }
            let mut seen: FxHashMap<usize, ()> = FxHashMap::default();
            for input in &reaction.inputs {
                if seen
                    .insert(MoleculeHandle::key(&input.molecule), ())
                    .is_some()
                {
                    return Err(ChemError::NonlinearInput {
                        reaction: reaction.name.clone(),
                        molecule: input.molecule.name().to_string(),
                    });
                }
            }
        }

        for (i, left) in reactions.iter().enumerate() {
            for right in &reactions[i + 1..] {
                if left.same_inputs(right) {
                    return Err(ChemError::ShadowedReactions(left.to_string()));
                }
                let (weaker, stronger) = if left.weaker_than(right) {
                    (left, right)
                } else if right.weaker_than(left) {
                    (right, left)
                } else {
                    continue;
                };
                reporter.report(SiteEvent::LivelockDetected {
                    site: name.clone(),
                    detail: format!("'{weaker}' shadows '{stronger}'"),
                });
                return Err(ChemError::UnavoidableIndeterminism {
                    weaker: weaker.to_string(),
                    stronger: stronger.to_string(),
                });
            }
        }

        check_statics(&reactions, &statics, &mol_index)?;

        let static_indices: Vec<usize> = statics
            .iter()
            .map(|(handle, _)| mol_index[&MoleculeHandle::key(handle)])
            .collect();

        // Pipelineability and the emit-time admission matchers.
        let mut molecules: Vec<MoleculeInfo> = Vec::with_capacity(handles.len());
        for (index, handle) in handles.iter().enumerate() {
            let pipelined = is_pipelined(index, &reactions, &mol_index);
            let admit = admission_matchers(index, &reactions, &mol_index);
            molecules.push(MoleculeInfo {
                handle: Arc::clone(handle),
                pipelined,
                is_static: static_indices.contains(&index),
                admit,
                volatile: None,
                when_emitted: Vec::new(),
            });
        }

        let bags: Vec<MoleculeBag> = molecules
            .iter()
            .map(|info| {
                let simple = is_simple_type(info.handle.type_id()) || info.handle.is_simple();
                if (simple || info.pipelined) && !info.handle.is_blocking() {
                    MoleculeBag::counted()
                } else {
                    MoleculeBag::queued()
                }
            })
            .collect();

        let compiled: Vec<CompiledReaction> = reactions
            .into_iter()
            .map(|reaction| CompiledReaction::compile(reaction, &mol_index))
            .collect();

        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        let site = Arc::new_cyclic(|me| ReactionSite {
            name: name.clone(),
            pool: pool.clone(),
            reporter,
            state: Mutex::new(SiteState {
                molecules,
                bags,
                reactions: compiled,
                rng,
                when_scheduled: Vec::new(),
            }),
            triggers: SegQueue::new(),
            me: me.clone(),
        });

        // Bind every input molecule to this site.
        {
            let state = site.state.lock();
            for (index, handle) in handles.iter().enumerate() {
                let consuming: Vec<String> = state
                    .reactions
                    .iter()
                    .filter(|reaction| reaction.input_mols.contains(&index))
                    .map(|reaction| reaction.def.name.clone())
                    .collect();
                handle.bind(Binding {
                    site: Arc::clone(&site),
                    index,
                    pipelined: state.molecules[index].pipelined,
                    consuming_reactions: consuming,
                })?;
            }
        }

        site.reporter.report(SiteEvent::SchedulerAssigned {
            site: name,
            pool: pool.name().to_string(),
        });

        for ((_, value), index) in statics.into_iter().zip(static_indices) {
            site.emit_initial(index, MolValue::plain(value));
        }

        Ok(site)
    }
}

/// Static-molecule install checks: declared statics must be consumed here,
/// carry an initial value, and be re-emitted exactly once (after chooser
/// shrinking) by every reaction consuming them.
fn check_statics(
    reactions: &[ReactionDef],
    statics: &[(Arc<MoleculeHandle>, Value)],
    mol_index: &FxHashMap<usize, usize>,
) -> Result<(), ChemError> {
    for (handle, _) in statics {
        if !handle.is_static() {
            return Err(ChemError::StaticMisuse(format!(
                "molecule '{}' was declared with an initial value but is not static",
                handle.name()
            )));
        }
        if !mol_index.contains_key(&MoleculeHandle::key(handle)) {
            return Err(ChemError::StaticMisuse(format!(
                "static molecule '{}' is not consumed by any reaction of this site",
                handle.name()
            )));
        }
    }

    for reaction in reactions {
        for input in &reaction.inputs {
            if !input.molecule.is_static() {
                continue;
            }
            if !statics
                .iter()
                .any(|(handle, _)| Arc::ptr_eq(handle, &input.molecule))
            {
                return Err(ChemError::StaticMisuse(format!(
                    "static molecule '{}' is consumed but has no declared initial value",
                    input.molecule.name()
                )));
            }
            let unconditional = unconditional_emissions(&reaction.outputs, &input.molecule);
            if unconditional != 1 {
                return Err(ChemError::StaticMisuse(format!(
                    "reaction '{}' re-emits static molecule '{}' {} times (must be exactly once)",
                    reaction.name,
                    input.molecule.name(),
                    unconditional
                )));
            }
        }
    }
    Ok(())
}

fn unconditional_emissions(outputs: &[OutputDef], molecule: &Arc<MoleculeHandle>) -> usize {
    crate::reaction::shrink_outputs(outputs)
        .iter()
        .filter(|output| Arc::ptr_eq(&output.molecule, molecule) && output.envs.is_empty())
        .count()
}

/// A molecule is pipelined iff no consuming reaction reads it through a
/// cross guard and it never appears repeated alongside a condition; its
/// remaining conditions are then all per-molecule and factorizable into
/// the emit-time admission test.
fn is_pipelined(
    index: usize,
    reactions: &[ReactionDef],
    mol_index: &FxHashMap<usize, usize>,
) -> bool {
    for reaction in reactions {
        let positions: Vec<usize> = reaction
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| mol_index[&MoleculeHandle::key(&input.molecule)] == index)
            .map(|(position, _)| position)
            .collect();
        if positions.is_empty() {
            continue;
        }
        let in_cross = positions.iter().any(|position| {
            reaction
                .cross_guards
                .iter()
                .any(|guard| guard.indices.contains(position))
        });
        if in_cross {
            return false;
        }
        let any_conditional = positions
            .iter()
            .any(|&position| !reaction.inputs[position].matcher.is_irrefutable());
        if positions.len() > 1 && any_conditional {
            return false;
        }
    }
    true
}

/// The per-molecule admission matchers for a pipelined molecule: `None`
/// when some consuming occurrence is unconditional (every value admitted),
/// otherwise the set of conditions a value must pass at least one of.
fn admission_matchers(
    index: usize,
    reactions: &[ReactionDef],
    mol_index: &FxHashMap<usize, usize>,
) -> Option<Vec<Matcher>> {
    let mut matchers = Vec::new();
    for reaction in reactions {
        for input in &reaction.inputs {
            if mol_index[&MoleculeHandle::key(&input.molecule)] != index {
                continue;
            }
            if input.matcher.is_irrefutable() {
                return None;
            }
            matchers.push(input.matcher.clone());
        }
    }
    Some(matchers)
}
