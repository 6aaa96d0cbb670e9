//! The match-search DSL driving backtracking over cross-constrained
//! inputs.
//!
//! Independent inputs are selected separately by the site; only inputs that
//! share a cross guard (or are repeats of one molecule) go through a
//! program of [`SearchOp`]s, precomputed per reaction at activation:
//!
//! - `ChooseMol(i)` iterates candidate copies for input position `i`,
//!   skipping copies already chosen for other positions of the same
//!   molecule;
//! - `ConstrainGuard(k)` filters by cross guard `k`, emitted immediately
//!   after the last input it references has been chosen;
//! - `CloseGroup` terminates a connected component.

use crate::bag::{MoleculeBag, Pick};
use crate::reaction::{CompiledReaction, ReactionDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOp {
    /// Choose a copy for this input position.
    ChooseMol(usize),
    /// Filter the staged prefix by this cross guard.
    ConstrainGuard(usize),
    /// End of a connected component.
    CloseGroup,
}

/// Generates the search program for one reaction.
///
/// Within each connected component of cross-dependent inputs (connected by
/// sharing a cross guard or by being repeats of one molecule), inputs are
/// ordered by decreasing number of cross-guard memberships, ties preferring
/// refutable matchers later. Each guard is emitted right after the last
/// input it references.
pub fn build_program(
    def: &ReactionDef,
    input_mols: &[usize],
    cross_positions: &[usize],
) -> Vec<SearchOp> {
    if cross_positions.is_empty() {
        return Vec::new();
    }

    // Union-find over the cross positions.
    let mut parent: Vec<usize> = (0..def.inputs.len()).collect();
    fn root(parent: &mut Vec<usize>, mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }
    let union = |parent: &mut Vec<usize>, a: usize, b: usize| {
        let (ra, rb) = (root(parent, a), root(parent, b));
        if ra != rb {
            parent[ra.max(rb)] = ra.min(rb);
        }
    };

    for guard in &def.cross_guards {
        for pair in guard.indices.windows(2) {
            union(&mut parent, pair[0], pair[1]);
        }
    }
    for (i, &a) in cross_positions.iter().enumerate() {
        for &b in &cross_positions[i + 1..] {
            if input_mols[a] == input_mols[b] {
                union(&mut parent, a, b);
            }
        }
    }

    // Group positions by component, components ordered by their smallest
    // position so generation is deterministic.
    let mut components: Vec<(usize, Vec<usize>)> = Vec::new();
    for &position in cross_positions {
        let component = root(&mut parent, position);
        match components.iter_mut().find(|(c, _)| *c == component) {
            Some((_, members)) => members.push(position),
            None => components.push((component, vec![position])),
        }
    }
    components.sort_by_key(|(c, _)| *c);

    let memberships = |position: usize| {
        def.cross_guards
            .iter()
            .filter(|guard| guard.indices.contains(&position))
            .count()
    };

    let mut program = Vec::new();
    for (_, mut members) in components {
        members.sort_by_key(|&position| {
            (
                std::cmp::Reverse(memberships(position)),
                // Refutable matchers chosen later: they prune against a
                // staged prefix instead of multiplying early branches.
                !def.inputs[position].matcher.is_irrefutable(),
                position,
            )
        });

        let mut chosen: Vec<usize> = Vec::with_capacity(members.len());
        let mut emitted_guards: Vec<usize> = Vec::new();
        for &position in &members {
            program.push(SearchOp::ChooseMol(position));
            chosen.push(position);
            for (k, guard) in def.cross_guards.iter().enumerate() {
                if emitted_guards.contains(&k) {
                    continue;
                }
                if guard.indices.iter().all(|index| chosen.contains(index)) {
                    program.push(SearchOp::ConstrainGuard(k));
                    emitted_guards.push(k);
                }
            }
        }
        program.push(SearchOp::CloseGroup);
    }
    program
}

/// Runs the reaction's search program against the bags, staging one pick
/// per cross-constrained input position. Returns `true` iff a complete
/// staging was found; on `false` nothing is staged.
///
/// `staged` is indexed by input position and may already hold the picks of
/// independent inputs; the program never touches those slots.
pub fn run_search(
    reaction: &CompiledReaction,
    bags: &[MoleculeBag],
    staged: &mut Vec<Option<Pick>>,
) -> bool {
    if reaction.program.is_empty() {
        return true;
    }
    solve(reaction, bags, staged, 0)
}

fn solve(
    reaction: &CompiledReaction,
    bags: &[MoleculeBag],
    staged: &mut Vec<Option<Pick>>,
    pc: usize,
) -> bool {
    let Some(op) = reaction.program.get(pc) else {
        return true;
    };
    match *op {
        SearchOp::ChooseMol(position) => {
            let molecule = reaction.input_mols[position];
            // Copies already staged for other positions of this molecule
            // must not be chosen twice.
            let skip: Vec<Pick> = reaction
                .input_mols
                .iter()
                .enumerate()
                .filter(|&(other, &m)| m == molecule && other != position)
                .filter_map(|(other, _)| staged[other].clone())
                .collect();
            let matcher = &reaction.def.inputs[position].matcher;
            for pick in bags[molecule].candidate_picks(&skip) {
                let admissible = bags[molecule]
                    .value_of(&pick)
                    .map_or(false, |value| matcher.matches(value));
                if !admissible {
                    continue;
                }
                staged[position] = Some(pick);
                if solve(reaction, bags, staged, pc + 1) {
                    return true;
                }
                staged[position] = None;
            }
            false
        }
        SearchOp::ConstrainGuard(k) => {
            let guard = &reaction.def.cross_guards[k];
            let mut values = Vec::with_capacity(guard.indices.len());
            for &position in &guard.indices {
                let value = staged[position]
                    .as_ref()
                    .and_then(|pick| bags[reaction.input_mols[position]].value_of(pick));
                match value {
                    Some(value) => values.push(value),
                    None => return false,
                }
            }
            if (guard.predicate)(&values) {
                solve(reaction, bags, staged, pc + 1)
            } else {
                false
            }
        }
        SearchOp::CloseGroup => solve(reaction, bags, staged, pc + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::MoleculeBag;
    use crate::molecule::MoleculeHandle;
    use crate::reaction::{InputDef, Matcher, ReactionDef};
    use crate::value::{MolData, MolValue, Value};
    use rustc_hash::FxHashMap;
    use std::any::TypeId;
    use std::sync::Arc;

    fn mol(name: &str) -> Arc<MoleculeHandle> {
        MoleculeHandle::new(name, TypeId::of::<i64>(), true, false, false)
    }

    fn as_i64(value: &dyn MolData) -> i64 {
        *value.as_any().downcast_ref::<i64>().unwrap()
    }

    fn compile(def: ReactionDef) -> CompiledReaction {
        let mut index = FxHashMap::default();
        for input in &def.inputs {
            let key = MoleculeHandle::key(&input.molecule);
            let next = index.len();
            index.entry(key).or_insert(next);
        }
        CompiledReaction::compile(def, &index)
    }

    fn queued_bag(values: &[i64]) -> MoleculeBag {
        let mut bag = MoleculeBag::queued();
        for &v in values {
            bag.add(MolValue::plain(Box::new(v) as Value));
        }
        bag
    }

    #[test]
    fn no_cross_constraints_means_empty_program() {
        let a = mol("a");
        let def = ReactionDef::builder("r")
            .input(InputDef::new(a, Matcher::Wildcard))
            .body(|_| Ok(()));
        let compiled = compile(def);
        assert!(compiled.program.is_empty());
    }

    #[test]
    fn guard_is_emitted_after_its_last_input() {
        let a = mol("a");
        let b = mol("b");
        let def = ReactionDef::builder("r")
            .input(InputDef::new(a, Matcher::Wildcard))
            .input(InputDef::new(b, Matcher::Wildcard))
            .cross_guard(vec![0, 1], |_| true)
            .body(|_| Ok(()));
        let compiled = compile(def);
        assert_eq!(
            compiled.program,
            vec![
                SearchOp::ChooseMol(0),
                SearchOp::ChooseMol(1),
                SearchOp::ConstrainGuard(0),
                SearchOp::CloseGroup,
            ]
        );
    }

    #[test]
    fn repeated_inputs_share_a_component() {
        let a = mol("a");
        let def = ReactionDef::builder("r")
            .allow_repeated_inputs()
            .input(InputDef::new(Arc::clone(&a), Matcher::Wildcard))
            .input(InputDef::new(a, Matcher::Wildcard))
            .cross_guard(vec![0, 1], |_| true)
            .body(|_| Ok(()));
        let compiled = compile(def);
        let closes = compiled
            .program
            .iter()
            .filter(|op| matches!(op, SearchOp::CloseGroup))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn search_finds_a_guard_satisfying_pair() {
        let a = mol("a");
        let def = ReactionDef::builder("sum")
            .allow_repeated_inputs()
            .input(InputDef::new(Arc::clone(&a), Matcher::Wildcard))
            .input(InputDef::new(a, Matcher::Wildcard))
            .cross_guard(vec![0, 1], |values| as_i64(values[0]) < as_i64(values[1]))
            .body(|_| Ok(()));
        let compiled = compile(def);

        let bags = vec![queued_bag(&[2, 1])];
        let mut staged = vec![None, None];
        assert!(run_search(&compiled, &bags, &mut staged));

        let x = as_i64(bags[0].value_of(staged[0].as_ref().unwrap()).unwrap());
        let y = as_i64(bags[0].value_of(staged[1].as_ref().unwrap()).unwrap());
        assert!(x < y);
    }

    #[test]
    fn search_never_picks_the_same_copy_twice() {
        let a = mol("a");
        let def = ReactionDef::builder("pair")
            .allow_repeated_inputs()
            .input(InputDef::new(Arc::clone(&a), Matcher::Wildcard))
            .input(InputDef::new(a, Matcher::Wildcard))
            .cross_guard(vec![0, 1], |values| {
                as_i64(values[0]) + as_i64(values[1]) == 10
            })
            .body(|_| Ok(()));
        let compiled = compile(def);

        // Only one copy of 5: 5+5 must not be formable from it alone.
        let bags = vec![queued_bag(&[5])];
        let mut staged = vec![None, None];
        assert!(!run_search(&compiled, &bags, &mut staged));
        assert!(staged.iter().all(Option::is_none));

        let bags = vec![queued_bag(&[5, 5])];
        let mut staged = vec![None, None];
        assert!(run_search(&compiled, &bags, &mut staged));
    }

    #[test]
    fn search_backtracks_over_failing_prefixes() {
        let a = mol("a");
        let b = mol("b");
        let def = ReactionDef::builder("match")
            .input(InputDef::new(a, Matcher::Wildcard))
            .input(InputDef::new(b, Matcher::Wildcard))
            .cross_guard(vec![0, 1], |values| {
                as_i64(values[0]) == as_i64(values[1])
            })
            .body(|_| Ok(()));
        let compiled = compile(def);

        // Only a=3, b=3 satisfies the guard; the search must walk past
        // a=1 and a=2.
        let bags = vec![queued_bag(&[1, 2, 3]), queued_bag(&[3])];
        let mut staged = vec![None, None];
        assert!(run_search(&compiled, &bags, &mut staged));
        let x = as_i64(bags[0].value_of(staged[0].as_ref().unwrap()).unwrap());
        assert_eq!(x, 3);
    }
}
