use std::sync::Arc;

use crate::{crypto::Hash, events::ConsensusEvent, unit::Unit};

/// Units ordered by one timing decision.
#[derive(Debug, Clone)]
pub struct TimingRound {
    /// Level of the timing unit.
    pub level: u32,
    pub timing_unit: Arc<Unit>,
    /// Units of the round in output order; the timing unit comes last.
    pub units: Vec<Arc<Unit>>,
}

impl TimingRound {
    pub fn hashes(&self) -> Vec<Hash> {
        self.units.iter().map(|unit| *unit.hash()).collect()
    }

    pub fn to_event(&self) -> ConsensusEvent {
        ConsensusEvent::TimingRoundOrdered {
            level: self.level,
            timing_unit: *self.timing_unit.hash(),
            units: self.hashes(),
        }
    }
}

/// Request for units a peer referenced but we do not have yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Peer expected to have the units.
    pub pid: u16,
    pub hashes: Vec<Hash>,
}
