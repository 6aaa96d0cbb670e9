//! Per-molecule multisets ("the soup", one bag per molecule per site).
//!
//! Two variants are chosen at site activation:
//!
//! - [`CountedBag`]: a value→count map for simple or pipelined non-blocking
//!   molecules, where copy identity is irrelevant.
//! - [`QueuedBag`]: an insertion-ordered multiset backed by a [`Slab`], for
//!   everything else. Slab keys give each copy a stable identity, which is
//!   what lets the search DSL skip already-chosen copies of a repeated
//!   input.
//!
//! Every operation here runs under the owning site's lock; bags carry no
//! synchronization of their own.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use slab::Slab;

use crate::value::{DynKey, MolData, MolValue};

/// A reference to one particular copy inside a bag, valid until that copy
/// is removed.
#[derive(Debug, Clone)]
pub enum Pick {
    /// One copy of this value in a counted bag.
    Counted(crate::value::Value),
    /// The copy stored under this slab key in a queued bag.
    Queued(usize),
}

impl Pick {
    fn matches_key(&self, key: &DynKey) -> bool {
        match self {
            Pick::Counted(value) => value.eq_dyn(&*key.0),
            Pick::Queued(_) => false,
        }
    }
}

/// Value→count multiset for simple or pipelined molecule types.
#[derive(Default)]
pub struct CountedBag {
    entries: FxHashMap<DynKey, CountedEntry>,
    total: usize,
}

#[derive(Default)]
struct CountedEntry {
    count: usize,
    /// Pending `emit_until_consumed` notifications for copies of this
    /// value; one fires per removed copy.
    notifies: Vec<alembic_sync::PromiseSetter<()>>,
}

/// Insertion-ordered multiset for complex or blocking molecule values.
#[derive(Default)]
pub struct QueuedBag {
    entries: Slab<MolValue>,
    order: VecDeque<usize>,
}

/// A per-molecule multiset, one of the two variants.
pub enum MoleculeBag {
    Counted(CountedBag),
    Queued(QueuedBag),
}

impl MoleculeBag {
    pub fn counted() -> MoleculeBag {
        MoleculeBag::Counted(CountedBag::default())
    }

    pub fn queued() -> MoleculeBag {
        MoleculeBag::Queued(QueuedBag::default())
    }

    /// Adds one copy. Blocking values must go to a queued bag; the site
    /// guarantees the variant choice at activation.
    pub fn add(&mut self, value: MolValue) {
        match self {
            MoleculeBag::Counted(bag) => match value {
                MolValue::Plain { value, notify } => {
                    let entry = bag.entries.entry(DynKey(value)).or_default();
                    entry.count += 1;
                    if let Some(notify) = notify {
                        entry.notifies.push(notify);
                    }
                    bag.total += 1;
                }
                MolValue::Blocking { .. } => {
                    unreachable!("blocking molecule values are never stored in a counted bag")
                }
            },
            MoleculeBag::Queued(bag) => {
                let key = bag.entries.insert(value);
                bag.order.push_back(key);
            }
        }
    }

    /// Number of copies present.
    pub fn len(&self) -> usize {
        match self {
            MoleculeBag::Counted(bag) => bag.total,
            MoleculeBag::Queued(bag) => bag.order.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of copies equal to `value`.
    pub fn count_of(&self, value: &dyn MolData) -> usize {
        match self {
            MoleculeBag::Counted(bag) => bag
                .entries
                .get(&DynKey(value.clone_dyn()))
                .map_or(0, |entry| entry.count),
            MoleculeBag::Queued(bag) => bag
                .order
                .iter()
                .filter(|&&key| bag.entries[key].value().eq_dyn(value))
                .count(),
        }
    }

    /// The oldest (queued) or an arbitrary (counted) copy. This is the only
    /// copy a pipelined molecule exposes to matching.
    pub fn head(&self) -> Option<Pick> {
        match self {
            MoleculeBag::Counted(bag) => bag
                .entries
                .iter()
                .find(|(_, entry)| entry.count > 0)
                .map(|(key, _)| Pick::Counted(key.0.clone())),
            MoleculeBag::Queued(bag) => bag.order.front().map(|&key| Pick::Queued(key)),
        }
    }

    /// All choosable copies, skipping the listed picks with their
    /// multiplicities. Abandoned blocking values are not offered.
    pub fn candidate_picks(&self, skip: &[Pick]) -> Vec<Pick> {
        match self {
            MoleculeBag::Counted(bag) => bag
                .entries
                .iter()
                .filter(|&(key, entry)| {
                    let skipped = skip.iter().filter(|pick| pick.matches_key(key)).count();
                    entry.count > skipped
                })
                .map(|(key, _)| Pick::Counted(key.0.clone()))
                .collect(),
            MoleculeBag::Queued(bag) => {
                let skipped: FxHashSet<usize> = skip
                    .iter()
                    .filter_map(|pick| match pick {
                        Pick::Queued(key) => Some(*key),
                        Pick::Counted(_) => None,
                    })
                    .collect();
                bag.order
                    .iter()
                    .copied()
                    .filter(|key| !skipped.contains(key))
                    .filter(|&key| !bag.entries[key].is_abandoned())
                    .map(Pick::Queued)
                    .collect()
            }
        }
    }

    /// The value a pick refers to, if it is still present.
    pub fn value_of(&self, pick: &Pick) -> Option<&dyn MolData> {
        match (self, pick) {
            (MoleculeBag::Counted(bag), Pick::Counted(value)) => bag
                .entries
                .get_key_value(&DynKey(value.clone()))
                .map(|(key, _)| &*key.0),
            (MoleculeBag::Queued(bag), Pick::Queued(key)) => {
                bag.entries.get(*key).map(|entry| entry.value())
            }
            _ => None,
        }
    }

    /// First copy satisfying `pred`, in bag order.
    pub fn find(&self, pred: impl Fn(&dyn MolData) -> bool) -> Option<Pick> {
        self.candidate_picks(&[]).into_iter().find(|pick| {
            self.value_of(pick).map_or(false, &pred)
        })
    }

    /// Removes the copy a pick refers to, firing its consumption
    /// notification.
    pub fn remove_pick(&mut self, pick: &Pick) -> Option<MolValue> {
        match (self, pick) {
            (MoleculeBag::Counted(bag), Pick::Counted(value)) => {
                let key = DynKey(value.clone());
                let entry = bag.entries.get_mut(&key)?;
                entry.count -= 1;
                let notify = entry.notifies.pop();
                if entry.count == 0 && entry.notifies.is_empty() {
                    bag.entries.remove(&key);
                }
                bag.total -= 1;
                if let Some(notify) = notify {
                    notify.set(());
                }
                Some(MolValue::Plain { value: value.clone(), notify: None })
            }
            (MoleculeBag::Queued(bag), Pick::Queued(key)) => {
                if !bag.entries.contains(*key) {
                    return None;
                }
                let mut value = bag.entries.remove(*key);
                bag.order.retain(|&k| k != *key);
                value.notify_consumed();
                Some(value)
            }
            _ => None,
        }
    }

    /// Removes and returns any one copy.
    pub fn take_one(&mut self) -> Option<MolValue> {
        let pick = self.head()?;
        self.remove_pick(&pick)
    }

    /// Removes and returns up to `n` copies as a multiset. The site only
    /// calls this after verifying the count requirement.
    pub fn take_any(&mut self, n: usize) -> Vec<MolValue> {
        let mut taken = Vec::with_capacity(n);
        for _ in 0..n {
            match self.take_one() {
                Some(value) => taken.push(value),
                None => break,
            }
        }
        taken
    }

    /// Drops blocking values whose emitters have given up waiting.
    /// Returns how many were dropped.
    pub fn purge_abandoned(&mut self) -> usize {
        match self {
            MoleculeBag::Counted(_) => 0,
            MoleculeBag::Queued(bag) => {
                let stale: Vec<usize> = bag
                    .order
                    .iter()
                    .filter(|&&key| bag.entries[key].is_abandoned())
                    .copied()
                    .collect();
                for key in &stale {
                    bag.entries.remove(*key);
                }
                bag.order.retain(|key| !stale.contains(key));
                stale.len()
            }
        }
    }

    /// Debug rendering of the bag contents, used by `log_soup`.
    pub fn values_debug(&self) -> String {
        match self {
            MoleculeBag::Counted(bag) => {
                let mut parts: Vec<String> = bag
                    .entries
                    .iter()
                    .map(|(key, entry)| {
                        if entry.count == 1 {
                            format!("{:?}", key.0)
                        } else {
                            format!("{:?} x {}", key.0, entry.count)
                        }
                    })
                    .collect();
                parts.sort();
                parts.join(", ")
            }
            MoleculeBag::Queued(bag) => bag
                .order
                .iter()
                .map(|&key| format!("{:?}", bag.entries[key]))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn plain(v: i64) -> MolValue {
        MolValue::plain(Box::new(v) as Value)
    }

    #[test]
    fn counted_bag_counts_copies() {
        let mut bag = MoleculeBag::counted();
        bag.add(plain(1));
        bag.add(plain(1));
        bag.add(plain(2));
        assert_eq!(bag.len(), 3);
        assert_eq!(bag.count_of(&1i64), 2);
        assert_eq!(bag.count_of(&2i64), 1);
        assert_eq!(bag.count_of(&3i64), 0);

        let taken = bag.take_any(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn counted_bag_skips_chosen_copies() {
        let mut bag = MoleculeBag::counted();
        bag.add(plain(7));
        bag.add(plain(7));

        let first = bag.candidate_picks(&[]);
        assert_eq!(first.len(), 1);
        // One copy staged: the value still has a second copy to offer.
        let second = bag.candidate_picks(&first);
        assert_eq!(second.len(), 1);
        // Both copies staged: nothing left.
        let staged = [first[0].clone(), second[0].clone()];
        assert!(bag.candidate_picks(&staged).is_empty());
    }

    #[test]
    fn queued_bag_is_insertion_ordered() {
        let mut bag = MoleculeBag::queued();
        bag.add(plain(10));
        bag.add(plain(20));
        bag.add(plain(30));

        let head = bag.head().unwrap();
        assert!(bag.value_of(&head).unwrap().eq_dyn(&10i64));

        let first = bag.take_one().unwrap();
        assert!(first.value().eq_dyn(&10i64));
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn queued_bag_skipping_is_per_copy() {
        let mut bag = MoleculeBag::queued();
        bag.add(plain(5));
        bag.add(plain(5));

        let picks = bag.candidate_picks(&[]);
        assert_eq!(picks.len(), 2);
        let rest = bag.candidate_picks(&picks[..1]);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn find_scans_in_order() {
        let mut bag = MoleculeBag::queued();
        bag.add(plain(-1));
        bag.add(plain(4));
        let pick = bag
            .find(|v| v.as_any().downcast_ref::<i64>().is_some_and(|n| *n > 0))
            .unwrap();
        assert!(bag.value_of(&pick).unwrap().eq_dyn(&4i64));
    }

    #[test]
    fn remove_pick_removes_one_copy() {
        let mut bag = MoleculeBag::counted();
        bag.add(plain(9));
        bag.add(plain(9));
        let pick = bag.head().unwrap();
        assert!(bag.remove_pick(&pick).is_some());
        assert_eq!(bag.count_of(&9i64), 1);
    }

    #[test]
    fn consumption_notifies_fire_on_removal() {
        let (setter, handle) = alembic_sync::promise();
        let mut bag = MoleculeBag::counted();
        bag.add(MolValue::Plain {
            value: Box::new(1u32) as Value,
            notify: Some(setter),
        });
        assert_eq!(handle.try_get(), None);
        bag.take_one();
        assert_eq!(handle.try_get(), Some(()));
    }
}
