use std::collections::HashSet;

use crate::{
    compliance::primes_at,
    crypto::{Hash, Keychain},
    dag::{Dag, DagStore},
    error::AlephError,
    unit::{Preunit, UnitIndex},
};

/// Supplies the payload of the next unit.
pub trait DataSource: Send + Sync + 'static {
    fn get_data(&self) -> Vec<u8>;
}

/// Data source producing empty payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyData;

impl DataSource for EmptyData {
    fn get_data(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Build and sign the next unit of the keychain owner on top of the current DAG.
///
/// Returns a dealing unit while the owner has none. Otherwise parents are taken
/// from the highest level down, each one showing prime units the earlier ones
/// at its level did not, until `max_parents` is reached.
pub fn new_unit(
    dag: &Dag,
    keychain: &Keychain,
    max_parents: usize,
    data: Vec<u8>,
) -> Result<Preunit, AlephError> {
    let me = keychain.pid();
    let (parents, level) = {
        let store = dag.read();
        let pred = match store.maximal_by(me) {
            [] => None,
            [pred] => Some(*pred),
            _ => {
                return Err(AlephError::Compliance(format!(
                    "process {me} has forked, refusing to extend"
                )));
            }
        };
        match pred {
            None => (Vec::new(), 0),
            Some(pred) => {
                let parents = choose_parents(&store, me, pred, max_parents);
                if parents.len() < 2 {
                    return Err(AlephError::NoAvailableParents);
                }
                let level = store.level_for(me, &parents);
                let hashes: Vec<Hash> = parents.iter().map(|p| *store.unit(*p).hash()).collect();
                (hashes, level)
            }
        }
    };
    let rs_data = dag
        .random_source()
        .data_to_include(me, &parents, level)?;
    Preunit::signed(keychain, parents, data, rs_data)
}

fn choose_parents(
    store: &DagStore,
    me: u16,
    pred: UnitIndex,
    max_parents: usize,
) -> Vec<UnitIndex> {
    let n_proc = store.n_proc();
    let pred_level = store.unit(pred).level();
    let max_level = store.max_level().unwrap_or(pred_level);
    let mut chosen = vec![pred];
    let mut by_level: Vec<Vec<UnitIndex>> = Vec::new();
    let mut used: HashSet<u16> = HashSet::from([me]);

    for level in (pred_level..=max_level).rev() {
        if chosen.len() >= max_parents {
            break;
        }
        let mut at_level = Vec::new();
        let mut seen = if level == pred_level {
            primes_at(store, pred, level)
        } else {
            HashSet::new()
        };
        for offset in 1..n_proc {
            if chosen.len() >= max_parents {
                break;
            }
            let pid = (me + offset) % n_proc;
            if used.contains(&pid) {
                continue;
            }
            // Forkers have more than one maximal unit and are never chosen.
            let [candidate] = store.maximal_by(pid) else {
                continue;
            };
            if store.unit(*candidate).level() != level {
                continue;
            }
            let primes = primes_at(store, *candidate, level);
            let first_above_pred = at_level.is_empty() && level != pred_level;
            if !first_above_pred && primes.is_subset(&seen) {
                continue;
            }
            if !mutes_no_forker(store, *candidate, &chosen) {
                continue;
            }
            seen.extend(primes);
            at_level.push(*candidate);
            chosen.push(*candidate);
            used.insert(pid);
        }
        by_level.push(at_level);
    }

    let mut parents = vec![pred];
    parents.extend(by_level.into_iter().rev().flatten());
    parents
}

fn mutes_no_forker(store: &DagStore, candidate: UnitIndex, chosen: &[UnitIndex]) -> bool {
    let unit = store.unit(candidate);
    chosen.iter().all(|other| {
        let other = store.unit(*other);
        unit.floor(other.creator()).len() <= 1 && other.floor(unit.creator()).len() <= 1
    })
}
