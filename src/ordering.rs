//! Linear ordering of the DAG.
//!
//! For every level starting at `order_start_level` one prime unit of that level
//! is chosen as the timing unit by a vote of higher prime units. Each timing
//! unit closes a round: all units below it that no earlier round took, sorted
//! layer by layer.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info};

use crate::{
    config::Config,
    crypto::Hash,
    dag::{Dag, DagStore},
    types::TimingRound,
    unit::{Unit, UnitIndex},
};

/// Chooses timing units, one level at a time.
pub struct TimingDecider {
    dag: Arc<Dag>,
    voting_level: u32,
    pi_delta_level: u32,
    order_start_level: u32,
    timing_units: Vec<Arc<Unit>>,
    /// Memoised votes by candidate level, then by `(candidate, voter)`.
    votes: HashMap<u32, HashMap<(Hash, Hash), bool>>,
}

impl TimingDecider {
    pub fn new(dag: Arc<Dag>, config: &Config) -> Self {
        Self {
            dag,
            voting_level: config.voting_level(),
            pi_delta_level: config.pi_delta_level(),
            order_start_level: config.order_start_level(),
            timing_units: Vec::new(),
            votes: HashMap::new(),
        }
    }

    pub fn timing_units(&self) -> &[Arc<Unit>] {
        &self.timing_units
    }

    /// Candidate levels that still have memoised votes.
    pub fn memoised_levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = self.votes.keys().copied().collect();
        levels.sort_unstable();
        levels
    }

    /// Level whose timing unit is decided next.
    pub fn next_level(&self) -> u32 {
        self.order_start_level + self.timing_units.len() as u32
    }

    /// Try to decide the timing unit of the next level.
    ///
    /// Candidates are the prime units of that level, by creator in the order of
    /// the common random permutation and by hash within one creator. The first
    /// candidate decided popular wins; an undecided candidate stops the scan.
    pub fn decide_timing(&mut self) -> Option<Arc<Unit>> {
        let level = self.next_level();
        let dag = Arc::clone(&self.dag);
        let store = dag.read();
        let max_level = store.max_level()?;
        if max_level < level + self.voting_level + 1 {
            return None;
        }
        for pid in dag.random_source().get_crp(level) {
            let mut candidates: Vec<UnitIndex> = store
                .prime_indices(level)
                .iter()
                .copied()
                .filter(|c| store.unit(*c).creator() == pid)
                .collect();
            candidates.sort_by_key(|c| *store.unit(*c).hash());
            for candidate in candidates {
                match self.decide(&store, candidate, max_level) {
                    Some(true) => {
                        let timing_unit = Arc::clone(store.unit(candidate));
                        info!(
                            "Timing unit for level {level}: {} by {pid}",
                            timing_unit.hash()
                        );
                        self.timing_units.push(Arc::clone(&timing_unit));
                        self.votes.retain(|candidate_level, _| *candidate_level > level);
                        return Some(timing_unit);
                    }
                    Some(false) => debug!(
                        "Candidate {} for level {level} decided unpopular",
                        store.unit(candidate).hash()
                    ),
                    None => return None,
                }
            }
        }
        None
    }

    /// Below the cutoff a candidate is decided once some prime unit sees a
    /// supermajority equal to the common vote of its level. At the cutoff the
    /// common coin decides, whatever the votes.
    fn decide(&mut self, store: &DagStore, candidate: UnitIndex, max_level: u32) -> Option<bool> {
        let level = store.unit(candidate).level();
        let first = level + self.voting_level + 1;
        let cutoff = level + self.voting_level + self.pi_delta_level;
        for deciding_level in first..max_level.saturating_add(1).min(cutoff) {
            let common = self.common_vote(store, candidate, deciding_level);
            for u in store.prime_indices(deciding_level) {
                if self.super_majority(store, candidate, *u) == Some(common) {
                    return Some(common);
                }
            }
        }
        if max_level >= cutoff {
            debug!("Forcing decision at level {cutoff} with the common coin");
            return Some(self.coin(store, candidate, cutoff));
        }
        None
    }

    /// Vote of `voter` about `candidate`; the voter is a prime unit at least
    /// `voting_level` levels higher.
    fn vote(&mut self, store: &DagStore, candidate: UnitIndex, voter: UnitIndex) -> bool {
        let candidate_level = store.unit(candidate).level();
        let key = (*store.unit(candidate).hash(), *store.unit(voter).hash());
        if let Some(vote) = self.votes.get(&candidate_level).and_then(|votes| votes.get(&key)) {
            return *vote;
        }
        let round = store.unit(voter).level() - store.unit(candidate).level();
        let vote = if round <= self.voting_level {
            proven_popular(store, candidate, voter)
        } else {
            match self.super_majority(store, candidate, voter) {
                Some(vote) => vote,
                None => self.common_vote(store, candidate, store.unit(voter).level()),
            }
        };
        self.votes.entry(candidate_level).or_default().insert(key, vote);
        vote
    }

    /// Value shared by a quorum of creators among the votes of prime units one
    /// level below `u` that lie below it.
    fn super_majority(&mut self, store: &DagStore, candidate: UnitIndex, u: UnitIndex) -> Option<bool> {
        let voting_level = store.unit(u).level().checked_sub(1)?;
        let mut yes = HashSet::new();
        let mut no = HashSet::new();
        for w in store.prime_indices(voting_level) {
            if !store.below(*w, u) {
                continue;
            }
            let creator = store.unit(*w).creator();
            if self.vote(store, candidate, *w) {
                yes.insert(creator);
            } else {
                no.insert(creator);
            }
        }
        if yes.len() >= store.quorum() {
            Some(true)
        } else if no.len() >= store.quorum() {
            Some(false)
        } else {
            None
        }
    }

    /// Expected vote at `level`: popular right after the first votes, then
    /// unpopular, then the common coin.
    fn common_vote(&self, store: &DagStore, candidate: UnitIndex, level: u32) -> bool {
        let round = level - store.unit(candidate).level();
        if round <= self.voting_level + 1 {
            return true;
        }
        if round == self.voting_level + 2 {
            return false;
        }
        self.coin(store, candidate, level)
    }

    fn coin(&self, store: &DagStore, candidate: UnitIndex, level: u32) -> bool {
        let candidate = store.unit(candidate);
        match self
            .dag
            .random_source()
            .random_bytes(candidate.creator(), level)
        {
            Some(bytes) => {
                let folded = bytes
                    .iter()
                    .chain(candidate.hash().as_bytes())
                    .fold(0u8, |acc, byte| acc ^ byte);
                folded & 1 == 1
            }
            None => candidate.hash().bit(level as usize),
        }
    }
}

/// A quorum of creators have units below `voter` that are above `candidate`.
fn proven_popular(store: &DagStore, candidate: UnitIndex, voter: UnitIndex) -> bool {
    let voter_unit = store.unit(voter);
    let creators = (0..store.n_proc())
        .filter(|pid| {
            voter_unit
                .floor(*pid)
                .iter()
                .any(|w| store.below(candidate, *w))
        })
        .count();
    creators >= store.quorum()
}

/// Turns timing units into ordered rounds.
pub struct RoundSorter {
    dag: Arc<Dag>,
    ordered: HashSet<UnitIndex>,
}

impl RoundSorter {
    pub fn new(dag: Arc<Dag>) -> Self {
        Self {
            dag,
            ordered: HashSet::new(),
        }
    }

    /// Collect the units below `timing_unit` not yet ordered, split them into
    /// layers by their longest path from an ordered unit, and sort each layer
    /// by creator position in the level's permutation, then by hash.
    pub fn timing_round(&mut self, level: u32, timing_unit: Arc<Unit>) -> TimingRound {
        let store = self.dag.read();
        let mut layer_of: HashMap<UnitIndex, usize> = HashMap::new();
        let mut stack = vec![(timing_unit.index(), false)];
        while let Some((index, expanded)) = stack.pop() {
            if layer_of.contains_key(&index) {
                continue;
            }
            let pending = store
                .unit(index)
                .parents()
                .iter()
                .filter(|p| !self.ordered.contains(*p));
            if expanded {
                let layer = pending
                    .filter_map(|p| layer_of.get(p).map(|l| l + 1))
                    .max()
                    .unwrap_or(0);
                layer_of.insert(index, layer);
            } else {
                let unvisited: Vec<UnitIndex> = pending
                    .filter(|p| !layer_of.contains_key(*p))
                    .copied()
                    .collect();
                stack.push((index, true));
                stack.extend(unvisited.into_iter().map(|p| (p, false)));
            }
        }

        let mut position = vec![0usize; store.n_proc() as usize];
        for (i, pid) in self.dag.random_source().get_crp(level).into_iter().enumerate() {
            if let Some(slot) = position.get_mut(pid as usize) {
                *slot = i;
            }
        }
        let depth = layer_of.values().copied().max().map_or(0, |d| d + 1);
        let mut layers: Vec<Vec<UnitIndex>> = vec![Vec::new(); depth];
        for (index, layer) in &layer_of {
            layers[*layer].push(*index);
        }
        let mut units = Vec::with_capacity(layer_of.len());
        for mut layer in layers {
            layer.sort_by_key(|index| {
                let unit = store.unit(*index);
                (position[unit.creator() as usize], *unit.hash())
            });
            units.extend(layer.into_iter().map(|index| Arc::clone(store.unit(index))));
        }
        self.ordered.extend(layer_of.keys().copied());
        debug!("Timing round {level} ordered {} units", units.len());
        TimingRound {
            level,
            timing_unit,
            units,
        }
    }
}

/// Decider and sorter driven together, for callers that order synchronously.
pub struct Ordering {
    decider: TimingDecider,
    sorter: RoundSorter,
}

impl Ordering {
    pub fn new(dag: Arc<Dag>, config: &Config) -> Self {
        Self {
            decider: TimingDecider::new(Arc::clone(&dag), config),
            sorter: RoundSorter::new(dag),
        }
    }

    pub fn decider(&self) -> &TimingDecider {
        &self.decider
    }

    /// Decide the next timing unit and order its round, if possible.
    pub fn next_round(&mut self) -> Option<TimingRound> {
        let timing_unit = self.decider.decide_timing()?;
        let level = timing_unit.level();
        Some(self.sorter.timing_round(level, timing_unit))
    }

    /// Every round that can be decided now.
    pub fn drain_rounds(&mut self) -> Vec<TimingRound> {
        std::iter::from_fn(|| self.next_round()).collect()
    }
}
