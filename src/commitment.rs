//! Commitments: which units of a known forker this process accepts.

use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

use crate::{
    crypto::{Committee, Hash, MultiSignature},
    error::AlephError,
    forking::ForkingProof,
    rmc::verify_proof,
    unit::Preunit,
};

/// Data and quorum signature that finished a reliable multicast of an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmcProof {
    pub data: Vec<u8>,
    pub signature: MultiSignature,
}

#[derive(Debug)]
pub enum Commitment {
    /// Taken straight from an alert: the committed unit of the forking proof.
    Base {
        rmc_id: u64,
        preunit: Option<Preunit>,
        rmc_proof: Option<RmcProof>,
    },
    /// Self-predecessor of the unit of `parent_commit`.
    Inferred {
        parent_commit: Arc<Commitment>,
        preunit: Preunit,
    },
}

impl Commitment {
    pub fn base(rmc_id: u64, preunit: Option<Preunit>, rmc_proof: Option<RmcProof>) -> Self {
        Commitment::Base {
            rmc_id,
            preunit,
            rmc_proof,
        }
    }

    pub fn preunit(&self) -> Option<&Preunit> {
        match self {
            Commitment::Base { preunit, .. } => preunit.as_ref(),
            Commitment::Inferred { preunit, .. } => Some(preunit),
        }
    }

    /// Hash of the committed unit.
    pub fn hash(&self) -> Option<&Hash> {
        self.preunit().map(Preunit::hash)
    }

    pub fn forker(&self) -> Option<u16> {
        self.preunit().map(Preunit::creator)
    }

    pub fn rmc_id(&self) -> u64 {
        match self {
            Commitment::Base { rmc_id, .. } => *rmc_id,
            Commitment::Inferred { parent_commit, .. } => parent_commit.rmc_id(),
        }
    }

    /// Committed preunits from the base down to this one.
    pub fn chain(&self) -> Vec<&Preunit> {
        let mut chain = match self {
            Commitment::Base { .. } => Vec::new(),
            Commitment::Inferred { parent_commit, .. } => parent_commit.chain(),
        };
        chain.extend(self.preunit());
        chain
    }

    /// Extend the commitment to `pred`, the self-predecessor of the committed unit.
    pub fn commitment_for_parent(
        self: &Arc<Self>,
        pred: &Preunit,
    ) -> Result<Commitment, AlephError> {
        let unit = self.preunit().ok_or_else(|| {
            AlephError::InvalidCommitment("empty commitment cannot justify parents".to_string())
        })?;
        if unit.creator() != pred.creator() {
            return Err(AlephError::InvalidCommitment(
                "cannot justify unit created by a different process".to_string(),
            ));
        }
        if unit.predecessor() != Some(pred.hash()) {
            return Err(AlephError::InvalidCommitment(
                "unit is not the self-predecessor of the committed unit".to_string(),
            ));
        }
        Ok(Commitment::Inferred {
            parent_commit: Arc::clone(self),
            preunit: pred.clone(),
        })
    }

    /// Verify that the base of this commitment is backed by a finished alert
    /// whose forking proof commits to the base unit.
    pub fn check_proof(&self, committee: &Committee) -> Result<ForkingProof, AlephError> {
        match self {
            Commitment::Inferred { parent_commit, .. } => parent_commit.check_proof(committee),
            Commitment::Base {
                rmc_id,
                preunit,
                rmc_proof,
            } => {
                let rmc_proof = rmc_proof.as_ref().ok_or_else(|| {
                    AlephError::InvalidCommitment("commitment carries no alert proof".to_string())
                })?;
                if !verify_proof(committee, *rmc_id, &rmc_proof.data, &rmc_proof.signature) {
                    return Err(AlephError::InvalidCommitment(
                        "alert proof is not signed by a quorum".to_string(),
                    ));
                }
                let proof = ForkingProof::decode(&rmc_proof.data)?;
                let committed = preunit.as_ref().ok_or_else(|| {
                    AlephError::InvalidCommitment("unitless commitment".to_string())
                })?;
                if proof.commit().map(Preunit::hash) != Some(committed.hash()) {
                    return Err(AlephError::InvalidCommitment(
                        "wrong proof for commit".to_string(),
                    ));
                }
                proof.check(committed.creator(), committee)?;
                Ok(proof)
            }
        }
    }
}

#[derive(Default)]
struct Entries {
    by_parties: HashMap<(u16, u16), Arc<Commitment>>,
    by_hash: HashMap<Hash, Arc<Commitment>>,
}

/// Commitments known to this process, by `(committer, forker)` and by unit hash.
#[derive(Default)]
pub struct CommitBase {
    entries: RwLock<Entries>,
}

impl CommitBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `commitment`; earlier entries for the same key win.
    pub fn add(&self, commitment: Arc<Commitment>, committer: u16, forker: u16) {
        let mut entries = self.entries.write();
        if let Some(hash) = commitment.hash() {
            entries
                .by_hash
                .entry(*hash)
                .or_insert_with(|| Arc::clone(&commitment));
        }
        entries
            .by_parties
            .entry((committer, forker))
            .or_insert(commitment);
    }

    pub fn get_by_parties(&self, committer: u16, forker: u16) -> Option<Arc<Commitment>> {
        self.entries
            .read()
            .by_parties
            .get(&(committer, forker))
            .cloned()
    }

    pub fn get_by_hash(&self, hash: &Hash) -> Option<Arc<Commitment>> {
        self.entries.read().by_hash.get(hash).cloned()
    }

    pub fn is_forker(&self, forker: u16) -> bool {
        self.entries
            .read()
            .by_parties
            .keys()
            .any(|(_, f)| *f == forker)
    }
}
