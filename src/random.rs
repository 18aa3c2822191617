use std::sync::Arc;

use crate::{
    crypto::{Hash, sha256},
    dag::Dag,
    error::AlephError,
    unit::Unit,
};

/// Source of shared randomness used by unit creation and ordering.
///
/// Every honest process must obtain the same `random_bytes` and `get_crp` values.
pub trait RandomSource: Send + Sync + 'static {
    /// Attach the source to the DAG it serves.
    fn bind(&self, _dag: &Arc<Dag>) {}

    /// Bytes to embed as `rs_data` in a unit of `creator` at `level`.
    fn data_to_include(
        &self,
        creator: u16,
        parents: &[Hash],
        level: u32,
    ) -> Result<Vec<u8>, AlephError>;

    /// Randomness revealed for `pid` at `level`, if already available.
    fn random_bytes(&self, pid: u16, level: u32) -> Option<Vec<u8>>;

    /// Common random permutation of committee members for `level`.
    fn get_crp(&self, level: u32) -> Vec<u16>;

    /// Validate the `rs_data` of a unit about to enter the DAG.
    fn check_compliance(&self, unit: &Unit) -> Result<(), AlephError>;
}

/// Beacon derived from a committee-wide seed.
///
/// Values are known in advance, which makes it suitable for tests and for
/// deployments whose unpredictability comes from elsewhere.
#[derive(Debug, Clone)]
pub struct DeterministicBeacon {
    seed: Hash,
    n_proc: u16,
    crp_fixed_prefix: u16,
}

impl DeterministicBeacon {
    pub fn new(seed: &[u8], n_proc: u16, crp_fixed_prefix: u16) -> Self {
        Self {
            seed: sha256(&[seed]),
            n_proc,
            crp_fixed_prefix,
        }
    }

    fn priority(&self, level: u32, pid: u16) -> Hash {
        sha256(&[
            self.seed.as_bytes(),
            b"crp",
            &level.to_le_bytes(),
            &pid.to_le_bytes(),
        ])
    }
}

impl RandomSource for DeterministicBeacon {
    fn data_to_include(
        &self,
        _creator: u16,
        _parents: &[Hash],
        level: u32,
    ) -> Result<Vec<u8>, AlephError> {
        Ok(level.to_le_bytes().to_vec())
    }

    fn random_bytes(&self, pid: u16, level: u32) -> Option<Vec<u8>> {
        if pid >= self.n_proc {
            return None;
        }
        let bytes = sha256(&[
            self.seed.as_bytes(),
            b"coin",
            &level.to_le_bytes(),
            &pid.to_le_bytes(),
        ]);
        Some(bytes.0.to_vec())
    }

    fn get_crp(&self, level: u32) -> Vec<u16> {
        let n = self.n_proc as u32;
        let prefix_len = self.crp_fixed_prefix.min(self.n_proc) as usize;
        let rotated: Vec<u16> = (0..n).map(|i| ((i + level) % n) as u16).collect();
        let (prefix, suffix) = rotated.split_at(prefix_len);
        let mut suffix = suffix.to_vec();
        suffix.sort_by_key(|pid| self.priority(level, *pid));
        prefix.iter().copied().chain(suffix).collect()
    }

    fn check_compliance(&self, unit: &Unit) -> Result<(), AlephError> {
        if unit.rs_data() != unit.level().to_le_bytes() {
            return Err(AlephError::Compliance(
                "random source data does not match level".to_string(),
            ));
        }
        Ok(())
    }
}
