//! Evidence that a committee member signed two units with the same predecessor.

use crate::{
    crypto::Committee,
    dag::DagStore,
    encoding::{ByteReader, encode_optional_preunit, encode_preunit},
    error::AlephError,
    unit::{Preunit, Unit, UnitIndex},
};

/// Two conflicting preunits by one creator, plus the unit of that creator the
/// raiser commits to.
///
/// Encoded as `preunit(u) | preunit(v) | optional preunit(commit)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkingProof {
    u: Preunit,
    v: Preunit,
    commit: Option<Preunit>,
}

impl ForkingProof {
    pub fn new(u: Preunit, v: Preunit, commit: Option<Preunit>) -> Self {
        Self { u, v, commit }
    }

    /// Look for a fork between `candidate`, not yet in the store, and the
    /// chain ending at `max`, a maximal unit by the same creator at least as high.
    ///
    /// Both chains are aligned at the candidate's height and walked down until
    /// their predecessors agree. Returns `None` when the candidate lies on the chain.
    pub fn find(store: &DagStore, candidate: &Unit, max: UnitIndex) -> Option<Self> {
        let mut v = store.chain_at_height(max, candidate.height())?;
        let mut u = candidate.preunit();
        let mut u_pred = candidate.predecessor();
        let mut v_pred = store.unit(v).predecessor();
        while u_pred != v_pred {
            let (Some(up), Some(vp)) = (u_pred, v_pred) else {
                return None;
            };
            u = store.unit(up).preunit();
            v = vp;
            u_pred = store.unit(up).predecessor();
            v_pred = store.unit(vp).predecessor();
        }
        let v = store.unit(v);
        if u.hash() == v.hash() {
            return None;
        }
        Some(Self {
            u: u.clone(),
            v: v.preunit().clone(),
            commit: Some(store.unit(max).preunit().clone()),
        })
    }

    pub fn forker(&self) -> u16 {
        self.u.creator()
    }

    pub fn u(&self) -> &Preunit {
        &self.u
    }

    pub fn v(&self) -> &Preunit {
        &self.v
    }

    pub fn commit(&self) -> Option<&Preunit> {
        self.commit.as_ref()
    }

    /// Same fork evidence, committing to another unit (or to nothing).
    pub fn with_commit(&self, commit: Option<Preunit>) -> Self {
        Self {
            u: self.u.clone(),
            v: self.v.clone(),
            commit,
        }
    }

    /// Validate the proof as evidence against `forker`.
    pub fn check(&self, forker: u16, committee: &Committee) -> Result<(), AlephError> {
        let invalid = |reason: &str| Err(AlephError::InvalidForkingProof(reason.to_string()));
        let units = [Some(&self.u), Some(&self.v), self.commit.as_ref()];
        for preunit in units.into_iter().flatten() {
            if preunit.creator() != forker {
                return invalid("creator differs from expected");
            }
            if !committee.verify_unit(forker, preunit.hash(), preunit.signature()) {
                return invalid("improper signature");
            }
        }
        if self.u.is_dealing() != self.v.is_dealing() {
            return invalid("only one of the units has a predecessor");
        }
        if self.u.predecessor() != self.v.predecessor() {
            return invalid("the units have different predecessors");
        }
        if self.u.hash() == self.v.hash() {
            return invalid("two copies of a unit are not a fork");
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = encode_preunit(&self.u);
        out.extend(encode_preunit(&self.v));
        out.extend(encode_optional_preunit(self.commit.as_ref()));
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AlephError> {
        let mut reader = ByteReader::new(bytes);
        let u = reader.preunit()?;
        let v = reader.preunit()?;
        let commit = reader.optional_preunit()?;
        if reader.remaining() != 0 {
            return Err(AlephError::Decode(
                "trailing bytes after forking proof".to_string(),
            ));
        }
        Ok(Self { u, v, commit })
    }
}
