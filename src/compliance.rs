//! Structural rules every unit must satisfy before it enters the DAG.

use std::collections::HashSet;

use crate::{
    dag::DagStore,
    error::AlephError,
    unit::{Unit, UnitIndex},
};

fn violation(reason: &str) -> AlephError {
    AlephError::Compliance(reason.to_string())
}

/// Check a built but not yet inserted unit against the units already in `store`.
pub fn check(store: &DagStore, unit: &Unit) -> Result<(), AlephError> {
    if unit.is_dealing() {
        return Ok(());
    }
    let parents = unit.parents();
    if parents.len() < 2 {
        return Err(violation("non-dealing unit needs at least two parents"));
    }
    check_parent_creators(store, unit)?;
    check_no_self_fork(store, unit)?;
    check_forker_muting(store, parents)?;
    check_expand_primes(store, parents)
}

fn check_parent_creators(store: &DagStore, unit: &Unit) -> Result<(), AlephError> {
    let parents = unit.parents();
    let pred = store.unit(parents[0]);
    if pred.creator() != unit.creator() {
        return Err(violation("not descendant of first parent"));
    }
    if pred.height() + 1 != unit.height() {
        return Err(violation("height does not follow the predecessor"));
    }
    let mut creators = HashSet::with_capacity(parents.len());
    for parent in &parents[1..] {
        let creator = store.unit(*parent).creator();
        if creator == unit.creator() {
            return Err(violation("second parent by the unit's own creator"));
        }
        if !creators.insert(creator) {
            return Err(violation("two parents by the same creator"));
        }
    }
    Ok(())
}

/// Parents must not see a unit of our creator that our predecessor does not.
fn check_no_self_fork(store: &DagStore, unit: &Unit) -> Result<(), AlephError> {
    let pred = unit.parents()[0];
    for parent in &unit.parents()[1..] {
        for w in store.unit(*parent).floor(unit.creator()) {
            if !store.below(*w, pred) {
                return Err(violation("parent sees a fork of the creator"));
            }
        }
    }
    Ok(())
}

/// A parent must not be built on a fork by the creator of another parent.
fn check_forker_muting(store: &DagStore, parents: &[UnitIndex]) -> Result<(), AlephError> {
    for a in parents {
        for b in parents {
            if a == b {
                continue;
            }
            let forker = store.unit(*b).creator();
            if store.unit(*a).floor(forker).len() > 1 {
                return Err(violation("parent is built on a fork of another parent's creator"));
            }
        }
    }
    Ok(())
}

/// Creators whose units of exactly `level` lie below `parent`.
pub(crate) fn primes_at(store: &DagStore, parent: UnitIndex, level: u32) -> HashSet<u16> {
    let unit = store.unit(parent);
    (0..store.n_proc())
        .filter(|pid| {
            unit.floor(*pid)
                .iter()
                .any(|w| store.reaches_level(*w, level))
        })
        .collect()
}

/// Parents after the first come in nondecreasing level order, and within one
/// level every parent shows a prime unit the previous ones did not.
fn check_expand_primes(store: &DagStore, parents: &[UnitIndex]) -> Result<(), AlephError> {
    let mut level = store.unit(parents[0]).level();
    let mut seen = primes_at(store, parents[0], level);
    for parent in &parents[1..] {
        let parent_level = store.unit(*parent).level();
        if parent_level < level {
            return Err(violation("parents are not ordered by level"));
        }
        if parent_level > level {
            level = parent_level;
            seen = primes_at(store, *parent, level);
            continue;
        }
        let primes = primes_at(store, *parent, level);
        if primes.is_subset(&seen) {
            return Err(violation("parent does not expand primes"));
        }
        seen.extend(primes);
    }
    Ok(())
}
