//! Hashing, unit signatures and the quorum multisignature used by reliable multicast.

use alloy::{
    primitives::{Address, B256, U256},
    signers::local::PrivateKeySigner,
};
use alloy_signer::{Signature, SignerSync};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::error::AlephError;

pub const HASH_LEN: usize = 32;
pub const UNIT_SIGNATURE_LEN: usize = 64;
pub const MESSAGE_SIGNATURE_LEN: usize = 65;

/// Signature of a unit: `r || s` over the unit hash.
pub type UnitSignature = [u8; UNIT_SIGNATURE_LEN];
/// Recoverable signature over an arbitrary message.
pub type MessageSignature = [u8; MESSAGE_SIGNATURE_LEN];

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub const ZERO: Hash = Hash([0; HASH_LEN]);

    pub fn from_slice(bytes: &[u8]) -> Result<Self, AlephError> {
        let array: [u8; HASH_LEN] =
            bytes
                .try_into()
                .map_err(|_| AlephError::MismatchedLength {
                    expect: HASH_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Hash(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_LEN]
    }

    /// The `index`-th bit of the hash, counting from the least significant bit of byte 0.
    pub fn bit(&self, index: usize) -> bool {
        let index = index % (8 * HASH_LEN);
        self.0[index / 8] & (1 << (index % 8)) != 0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

/// Unit hash over the creator, the parent hashes, the payload and the randomness data.
pub fn compute_unit_hash(creator: u16, parents: &[Hash], data: &[u8], rs_data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(creator.to_le_bytes());
    hasher.update((parents.len() as u16).to_le_bytes());
    for parent in parents {
        hasher.update(parent.as_bytes());
    }
    hasher.update((data.len() as u32).to_le_bytes());
    hasher.update(data);
    hasher.update((rs_data.len() as u32).to_le_bytes());
    hasher.update(rs_data);
    Hash(hasher.finalize().into())
}

pub fn sha256(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash(hasher.finalize().into())
}

/// Public view of the committee: one signing address per process.
#[derive(Debug, Clone)]
pub struct Committee {
    addresses: Vec<Address>,
}

impl Committee {
    pub fn new(addresses: Vec<Address>) -> Result<Self, AlephError> {
        if addresses.len() < 4 {
            return Err(AlephError::InvalidConfiguration(format!(
                "committee needs at least 4 members, got {}",
                addresses.len()
            )));
        }
        if addresses.len() >= u16::MAX as usize {
            return Err(AlephError::InvalidConfiguration(
                "committee too large".to_string(),
            ));
        }
        Ok(Self { addresses })
    }

    pub fn n_proc(&self) -> u16 {
        self.addresses.len() as u16
    }

    /// Largest number of Byzantine members tolerated: `(N - 1) / 3`.
    pub fn max_faulty(&self) -> usize {
        (self.addresses.len() - 1) / 3
    }

    pub fn quorum(&self) -> usize {
        2 * self.max_faulty() + 1
    }

    pub fn is_quorum(&self, count: usize) -> bool {
        count >= self.quorum()
    }

    pub fn address(&self, pid: u16) -> Option<&Address> {
        self.addresses.get(pid as usize)
    }

    pub fn verify_unit(&self, creator: u16, hash: &Hash, signature: &UnitSignature) -> bool {
        let Some(expected) = self.address(creator) else {
            return false;
        };
        let r = U256::from_be_slice(&signature[..32]);
        let s = U256::from_be_slice(&signature[32..]);
        let prehash = B256::from(hash.0);
        // r || s drops the recovery bit, so both parities are tried.
        [false, true].into_iter().any(|parity| {
            Signature::new(r, s, parity)
                .recover_address_from_prehash(&prehash)
                .is_ok_and(|address| address == *expected)
        })
    }

    pub fn verify_message(&self, pid: u16, message: &[u8], signature: &MessageSignature) -> bool {
        let Some(expected) = self.address(pid) else {
            return false;
        };
        Signature::from_raw_array(signature)
            .and_then(|signature| signature.recover_address_from_msg(message))
            .is_ok_and(|address| address == *expected)
    }
}

/// The local member's private view: its pid, its key and the committee.
#[derive(Clone)]
pub struct Keychain {
    pid: u16,
    signer: PrivateKeySigner,
    committee: Arc<Committee>,
}

impl Keychain {
    pub fn new(
        pid: u16,
        signer: PrivateKeySigner,
        committee: Arc<Committee>,
    ) -> Result<Self, AlephError> {
        match committee.address(pid) {
            Some(address) if *address == signer.address() => Ok(Self {
                pid,
                signer,
                committee,
            }),
            Some(_) => Err(AlephError::InvalidConfiguration(format!(
                "signer address does not match committee entry {pid}"
            ))),
            None => Err(AlephError::InvalidMember(pid)),
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn committee(&self) -> &Arc<Committee> {
        &self.committee
    }

    pub fn n_proc(&self) -> u16 {
        self.committee.n_proc()
    }

    pub fn sign_unit(&self, hash: &Hash) -> Result<UnitSignature, AlephError> {
        let signature = self.signer.sign_hash_sync(&B256::from(hash.0))?;
        let mut out = [0u8; UNIT_SIGNATURE_LEN];
        out[..32].copy_from_slice(&signature.r().to_be_bytes::<32>());
        out[32..].copy_from_slice(&signature.s().to_be_bytes::<32>());
        Ok(out)
    }

    pub fn sign_message(&self, message: &[u8]) -> Result<MessageSignature, AlephError> {
        Ok(self.signer.sign_message_sync(message)?.as_bytes())
    }
}

impl fmt::Debug for Keychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keychain")
            .field("pid", &self.pid)
            .field("n_proc", &self.committee.n_proc())
            .finish()
    }
}

/// Signature shares gathered from distinct members over one message.
///
/// Complete once a quorum of members contributed. Stands in for a threshold
/// signature: anyone holding the committee addresses can check it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiSignature {
    shares: BTreeMap<u16, MessageSignature>,
}

impl MultiSignature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `pid` already contributed.
    pub fn add(&mut self, pid: u16, share: MessageSignature) -> bool {
        if self.shares.contains_key(&pid) {
            return false;
        }
        self.shares.insert(pid, share);
        true
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    pub fn is_complete(&self, committee: &Committee) -> bool {
        committee.is_quorum(self.shares.len())
    }

    pub fn verify(&self, committee: &Committee, message: &[u8]) -> bool {
        self.is_complete(committee)
            && self
                .shares
                .iter()
                .all(|(pid, share)| committee.verify_message(*pid, message, share))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.shares.len() * (2 + MESSAGE_SIGNATURE_LEN));
        out.extend_from_slice(&(self.shares.len() as u16).to_le_bytes());
        for (pid, share) in &self.shares {
            out.extend_from_slice(&pid.to_le_bytes());
            out.extend_from_slice(share);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AlephError> {
        if bytes.len() < 2 {
            return Err(AlephError::Decode("multisignature too short".to_string()));
        }
        let count = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let expect = 2 + count * (2 + MESSAGE_SIGNATURE_LEN);
        if bytes.len() != expect {
            return Err(AlephError::MismatchedLength {
                expect,
                actual: bytes.len(),
            });
        }
        let mut multisig = MultiSignature::new();
        for chunk in bytes[2..].chunks_exact(2 + MESSAGE_SIGNATURE_LEN) {
            let pid = u16::from_le_bytes([chunk[0], chunk[1]]);
            let mut share = [0u8; MESSAGE_SIGNATURE_LEN];
            share.copy_from_slice(&chunk[2..]);
            if !multisig.add(pid, share) {
                return Err(AlephError::Decode(format!(
                    "duplicate share from {pid} in multisignature"
                )));
            }
        }
        Ok(multisig)
    }
}
