//! The local DAG of units.
//!
//! Units live in an append-only arena owned by [`DagStore`]; they refer to each
//! other by [`UnitIndex`]. Queries hand out `Arc<Unit>` handles that never change.

use parking_lot::{RwLock, RwLockReadGuard};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

use crate::{
    compliance,
    crypto::{Committee, Hash},
    error::AlephError,
    random::RandomSource,
    unit::{Preunit, Unit, UnitIndex},
    utils::unit_id,
};

/// Callback run after every successful insertion.
pub type InsertObserver = Box<dyn Fn(&Arc<Unit>) + Send + Sync>;

/// Last check before a fully built unit enters the DAG.
///
/// Runs while the DAG is write-locked, so it must not touch the [`Dag`] handle.
pub trait InsertGuard {
    fn check(&self, store: &DagStore, unit: &Unit) -> Result<(), AlephError>;
}

pub struct NoGuard;

impl InsertGuard for NoGuard {
    fn check(&self, _store: &DagStore, _unit: &Unit) -> Result<(), AlephError> {
        Ok(())
    }
}

/// Arena and indices of the DAG.
#[derive(Debug)]
pub struct DagStore {
    n_proc: u16,
    quorum: usize,
    units: Vec<Arc<Unit>>,
    by_hash: HashMap<Hash, UnitIndex>,
    by_id: HashMap<u64, Vec<UnitIndex>>,
    /// Per creator, maximal units in order of acceptance.
    maximal: Vec<Vec<UnitIndex>>,
    /// Prime units by level.
    primes: Vec<Vec<UnitIndex>>,
    max_level: Option<u32>,
}

impl DagStore {
    fn new(n_proc: u16, quorum: usize) -> Self {
        Self {
            n_proc,
            quorum,
            units: Vec::new(),
            by_hash: HashMap::new(),
            by_id: HashMap::new(),
            maximal: vec![Vec::new(); n_proc as usize],
            primes: Vec::new(),
            max_level: None,
        }
    }

    pub fn n_proc(&self) -> u16 {
        self.n_proc
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Panics on an index that did not come from this store.
    pub fn unit(&self, index: UnitIndex) -> &Arc<Unit> {
        &self.units[index.0]
    }

    pub fn index_of(&self, hash: &Hash) -> Option<UnitIndex> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<Unit>> {
        self.index_of(hash).map(|index| Arc::clone(self.unit(index)))
    }

    pub fn get_by_id(&self, id: u64) -> Vec<Arc<Unit>> {
        self.by_id
            .get(&id)
            .map(|indices| indices.iter().map(|i| Arc::clone(self.unit(*i))).collect())
            .unwrap_or_default()
    }

    pub fn maximal_by(&self, creator: u16) -> &[UnitIndex] {
        self.maximal
            .get(creator as usize)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn maximal_units_per_process(&self) -> Vec<Vec<Arc<Unit>>> {
        self.maximal
            .iter()
            .map(|indices| indices.iter().map(|i| Arc::clone(self.unit(*i))).collect())
            .collect()
    }

    pub fn prime_indices(&self, level: u32) -> &[UnitIndex] {
        self.primes
            .get(level as usize)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn prime_units(&self, level: u32) -> Vec<Arc<Unit>> {
        self.prime_indices(level)
            .iter()
            .map(|i| Arc::clone(self.unit(*i)))
            .collect()
    }

    pub fn max_level(&self) -> Option<u32> {
        self.max_level
    }

    pub fn units(&self) -> impl Iterator<Item = &Arc<Unit>> {
        self.units.iter()
    }

    /// Units of `creator` strictly above `height`, lowest first; every unit for `None`.
    pub fn units_above_height(&self, creator: u16, height: Option<u32>) -> Vec<Arc<Unit>> {
        let mut units = Vec::new();
        let mut next = height.map_or(0, |h| h + 1);
        loop {
            let at_height = self.get_by_id(unit_id(creator, next, self.n_proc));
            if at_height.is_empty() {
                return units;
            }
            units.extend(at_height);
            next += 1;
        }
    }

    /// The unit of the same creator at `height` on the self-predecessor chain of `from`.
    pub fn chain_at_height(&self, from: UnitIndex, height: u32) -> Option<UnitIndex> {
        let mut current = from;
        loop {
            let unit = self.unit(current);
            if unit.height == height {
                return Some(current);
            }
            if unit.height < height {
                return None;
            }
            current = unit.predecessor()?;
        }
    }

    /// Whether `a` is below or equal to `b`.
    pub fn below(&self, a: UnitIndex, b: UnitIndex) -> bool {
        if a == b {
            return true;
        }
        let lower = self.unit(a);
        self.unit(b)
            .floor(lower.creator())
            .iter()
            .any(|w| self.chain_at_height(*w, lower.height) == Some(a))
    }

    /// Whether the creator chain ending at `from` contains a unit of exactly `level`.
    pub fn reaches_level(&self, from: UnitIndex, level: u32) -> bool {
        let mut current = from;
        loop {
            let unit = self.unit(current);
            if unit.level <= level {
                return unit.level == level;
            }
            match unit.predecessor() {
                Some(pred) => current = pred,
                None => return false,
            }
        }
    }

    pub(crate) fn resolve_parents(&self, hashes: &[Hash]) -> Result<Vec<UnitIndex>, AlephError> {
        let mut parents = Vec::with_capacity(hashes.len());
        let mut missing_count = 0;
        for hash in hashes {
            match self.index_of(hash) {
                Some(index) => parents.push(index),
                None => missing_count += 1,
            }
        }
        if missing_count > 0 {
            return Err(AlephError::UnknownParents { missing_count });
        }
        Ok(parents)
    }

    /// Floors of a prospective unit, without its own creator's entry.
    pub(crate) fn merge_floors(&self, creator: u16, parents: &[UnitIndex]) -> Vec<Vec<UnitIndex>> {
        let mut floor = vec![Vec::new(); self.n_proc as usize];
        for pid in 0..self.n_proc {
            if pid == creator {
                continue;
            }
            let mut candidates: Vec<UnitIndex> = Vec::new();
            for parent in parents {
                for w in self.unit(*parent).floor(pid) {
                    if !candidates.contains(w) {
                        candidates.push(*w);
                    }
                }
            }
            floor[pid as usize] = candidates
                .iter()
                .copied()
                .filter(|w| {
                    !candidates
                        .iter()
                        .any(|other| other != w && self.below(*w, *other))
                })
                .collect();
        }
        floor
    }

    fn level_from_floor(
        &self,
        creator: u16,
        parents: &[UnitIndex],
        floor: &[Vec<UnitIndex>],
    ) -> u32 {
        let Some(pred) = parents.first() else {
            return 0;
        };
        let max_level = parents
            .iter()
            .map(|p| self.unit(*p).level)
            .max()
            .unwrap_or(0);
        let seen = (0..self.n_proc)
            .filter(|pid| {
                if *pid == creator {
                    self.reaches_level(*pred, max_level)
                } else {
                    floor[*pid as usize]
                        .iter()
                        .any(|w| self.reaches_level(*w, max_level))
                }
            })
            .count();
        if seen >= self.quorum {
            max_level + 1
        } else {
            max_level
        }
    }

    /// Level a unit by `creator` with these parents would get.
    pub fn level_for(&self, creator: u16, parents: &[UnitIndex]) -> u32 {
        let floor = self.merge_floors(creator, parents);
        self.level_from_floor(creator, parents, &floor)
    }

    pub(crate) fn build_unit(
        &self,
        preunit: Preunit,
        parents: Vec<UnitIndex>,
    ) -> Result<Unit, AlephError> {
        let creator = preunit.creator();
        let index = UnitIndex(self.units.len());
        let Some(pred) = parents.first().copied() else {
            let mut floor = vec![Vec::new(); self.n_proc as usize];
            floor[creator as usize] = vec![index];
            return Ok(Unit {
                index,
                preunit,
                height: 0,
                level: 0,
                prime: true,
                parents,
                floor,
            });
        };
        let pred_unit = self.unit(pred);
        if pred_unit.creator() != creator {
            return Err(AlephError::Compliance(
                "not descendant of first parent".to_string(),
            ));
        }
        let height = pred_unit.height + 1;
        let mut floor = self.merge_floors(creator, &parents);
        let level = self.level_from_floor(creator, &parents, &floor);
        floor[creator as usize] = vec![index];
        let prime = level > pred_unit.level;
        Ok(Unit {
            index,
            preunit,
            height,
            level,
            prime,
            parents,
            floor,
        })
    }

    fn insert(&mut self, unit: Unit) -> Arc<Unit> {
        let unit = Arc::new(unit);
        let index = unit.index;
        let id = unit_id(unit.creator(), unit.height, self.n_proc);
        self.by_hash.insert(*unit.hash(), index);
        self.by_id.entry(id).or_default().push(index);

        let maximal = &mut self.maximal[unit.creator() as usize];
        if let Some(pred) = unit.predecessor() {
            maximal.retain(|m| *m != pred);
        }
        maximal.push(index);

        if unit.prime {
            let level = unit.level as usize;
            if self.primes.len() <= level {
                self.primes.resize_with(level + 1, Vec::new);
            }
            self.primes[level].push(index);
        }
        self.max_level = Some(self.max_level.map_or(unit.level, |l| l.max(unit.level)));
        self.units.push(Arc::clone(&unit));
        unit
    }
}

/// Thread-safe DAG handle.
pub struct Dag {
    committee: Arc<Committee>,
    random_source: Arc<dyn RandomSource>,
    store: RwLock<DagStore>,
    observers: RwLock<Vec<InsertObserver>>,
}

impl Dag {
    pub fn new(committee: Arc<Committee>, random_source: Arc<dyn RandomSource>) -> Self {
        let store = DagStore::new(committee.n_proc(), committee.quorum());
        Self {
            committee,
            random_source,
            store: RwLock::new(store),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn n_proc(&self) -> u16 {
        self.committee.n_proc()
    }

    pub fn committee(&self) -> &Arc<Committee> {
        &self.committee
    }

    pub fn random_source(&self) -> &Arc<dyn RandomSource> {
        &self.random_source
    }

    /// Read access to the arena. Do not hold the guard across an `.await`.
    pub fn read(&self) -> RwLockReadGuard<'_, DagStore> {
        self.store.read()
    }

    pub fn after_insert(&self, observer: InsertObserver) {
        self.observers.write().push(observer);
    }

    pub fn add_unit(&self, preunit: Preunit) -> Result<Arc<Unit>, AlephError> {
        self.add_unit_guarded(preunit, &NoGuard)
    }

    /// Validate `preunit` against the DAG and insert it.
    pub fn add_unit_guarded(
        &self,
        preunit: Preunit,
        guard: &dyn InsertGuard,
    ) -> Result<Arc<Unit>, AlephError> {
        let creator = preunit.creator();
        if creator >= self.n_proc() {
            return Err(AlephError::InvalidMember(creator));
        }
        let hash = *preunit.hash();
        let unit = {
            let mut store = self.store.write();
            if store.contains(&hash) {
                return Err(AlephError::DuplicateUnit(hash));
            }
            let parents = store.resolve_parents(preunit.parents())?;
            if !self
                .committee
                .verify_unit(creator, &hash, preunit.signature())
            {
                warn!("Rejecting unit {hash} by {creator}: invalid signature");
                return Err(AlephError::InvalidUnitSignature { creator });
            }
            let unit = store.build_unit(preunit, parents)?;
            compliance::check(&store, &unit)
                .and_then(|_| self.random_source.check_compliance(&unit))
                .inspect_err(|err| debug!("Unit {hash} by {creator} not compliant: {err}"))?;
            guard.check(&store, &unit)?;
            store.insert(unit)
        };
        debug!(
            "Added unit {hash} by {creator} at height {} level {}",
            unit.height(),
            unit.level()
        );
        for observer in self.observers.read().iter() {
            observer(&unit);
        }
        Ok(unit)
    }

    /// Insert a batch; one result slot per preunit.
    pub fn add_antichain(&self, preunits: Vec<Preunit>) -> Vec<Result<Arc<Unit>, AlephError>> {
        preunits
            .into_iter()
            .map(|preunit| self.add_unit(preunit))
            .collect()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.store.read().contains(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<Unit>> {
        self.store.read().get(hash)
    }

    pub fn get_by_id(&self, id: u64) -> Vec<Arc<Unit>> {
        self.store.read().get_by_id(id)
    }

    pub fn maximal_units_per_process(&self) -> Vec<Vec<Arc<Unit>>> {
        self.store.read().maximal_units_per_process()
    }

    pub fn prime_units(&self, level: u32) -> Vec<Arc<Unit>> {
        self.store.read().prime_units(level)
    }

    pub fn max_level(&self) -> Option<u32> {
        self.store.read().max_level()
    }

    /// Whether `u` is below or equal to `v`. Both must come from this DAG.
    pub fn below(&self, u: &Unit, v: &Unit) -> bool {
        self.store.read().below(u.index(), v.index())
    }
}
