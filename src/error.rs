use alloy::primitives::SignatureError;

use crate::crypto::Hash;

#[derive(Debug, thiserror::Error)]
pub enum AlephError {
    #[error("Compliance error: {0}")]
    Compliance(String),
    #[error("Invalid signature on unit created by {creator}")]
    InvalidUnitSignature { creator: u16 },
    #[error("Unknown parents: {missing_count} missing")]
    UnknownParents { missing_count: usize },
    #[error("Duplicate unit {0}")]
    DuplicateUnit(Hash),
    #[error("Duplicate preunit {0}")]
    DuplicatePreunit(Hash),
    #[error("Missing data: {0}")]
    MissingData(String),
    #[error("No available parents")]
    NoAvailableParents,

    #[error("Invalid forking proof: {0}")]
    InvalidForkingProof(String),
    #[error("Invalid commitment: {0}")]
    InvalidCommitment(String),
    #[error("Invalid alert id {0}")]
    InvalidAlertId(u64),
    #[error("RMC error: {0}")]
    Rmc(String),

    #[error("Network error: {0}")]
    Network(String),
    #[error("Operation timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("Mismatched length: expected {expect}, actual {actual}")]
    MismatchedLength { expect: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid committee member {0}")]
    InvalidMember(u16),

    #[error("Invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("Failed to sign message: {0}")]
    FailedToSignMessage(#[from] alloy_signer::Error),

    #[error("{} of {total} preunits rejected", .failures.len())]
    Aggregate {
        total: usize,
        failures: Vec<(usize, AlephError)>,
    },
    #[error("Service stopped")]
    ServiceStopped,
}

impl AlephError {
    /// Errors that only tell us we already have the data.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            AlephError::DuplicateUnit(_) | AlephError::DuplicatePreunit(_)
        )
    }

    /// Collapse per-preunit results into one aggregate, ignoring duplicates.
    pub fn aggregate<T>(results: Vec<Result<T, AlephError>>) -> Result<Vec<T>, AlephError> {
        let total = results.len();
        let mut values = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (slot, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(err) if err.is_duplicate() => {}
                Err(err) => failures.push((slot, err)),
            }
        }
        if failures.is_empty() {
            Ok(values)
        } else {
            Err(AlephError::Aggregate { total, failures })
        }
    }
}
