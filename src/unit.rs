use crate::{
    crypto::{Hash, Keychain, UnitSignature, compute_unit_hash},
    error::AlephError,
    utils::unit_id,
};

/// A signed unit as it travels between processes, before its parents are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preunit {
    creator: u16,
    parents: Vec<Hash>,
    data: Vec<u8>,
    rs_data: Vec<u8>,
    signature: UnitSignature,
    hash: Hash,
}

impl Preunit {
    pub fn new(
        creator: u16,
        parents: Vec<Hash>,
        data: Vec<u8>,
        rs_data: Vec<u8>,
        signature: UnitSignature,
    ) -> Self {
        let hash = compute_unit_hash(creator, &parents, &data, &rs_data);
        Self {
            creator,
            parents,
            data,
            rs_data,
            signature,
            hash,
        }
    }

    /// Build and sign a preunit created by the keychain owner.
    pub fn signed(
        keychain: &Keychain,
        parents: Vec<Hash>,
        data: Vec<u8>,
        rs_data: Vec<u8>,
    ) -> Result<Self, AlephError> {
        let creator = keychain.pid();
        let hash = compute_unit_hash(creator, &parents, &data, &rs_data);
        let signature = keychain.sign_unit(&hash)?;
        Ok(Self {
            creator,
            parents,
            data,
            rs_data,
            signature,
            hash,
        })
    }

    pub fn creator(&self) -> u16 {
        self.creator
    }

    /// Parent hashes; the first one is the self-predecessor.
    pub fn parents(&self) -> &[Hash] {
        &self.parents
    }

    pub fn predecessor(&self) -> Option<&Hash> {
        self.parents.first()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn rs_data(&self) -> &[u8] {
        &self.rs_data
    }

    pub fn signature(&self) -> &UnitSignature {
        &self.signature
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn is_dealing(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Position of a unit in the DAG arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitIndex(pub(crate) usize);

impl UnitIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// A unit stored in the DAG. Immutable once inserted.
#[derive(Debug, Clone)]
pub struct Unit {
    pub(crate) index: UnitIndex,
    pub(crate) preunit: Preunit,
    pub(crate) height: u32,
    pub(crate) level: u32,
    pub(crate) prime: bool,
    pub(crate) parents: Vec<UnitIndex>,
    pub(crate) floor: Vec<Vec<UnitIndex>>,
}

impl Unit {
    pub fn index(&self) -> UnitIndex {
        self.index
    }

    pub fn creator(&self) -> u16 {
        self.preunit.creator
    }

    pub fn hash(&self) -> &Hash {
        &self.preunit.hash
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Whether the level is strictly above the self-predecessor's level.
    pub fn is_prime(&self) -> bool {
        self.prime
    }

    pub fn is_dealing(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn parents(&self) -> &[UnitIndex] {
        &self.parents
    }

    pub fn parent_hashes(&self) -> &[Hash] {
        &self.preunit.parents
    }

    pub fn predecessor(&self) -> Option<UnitIndex> {
        self.parents.first().copied()
    }

    /// Maximal units by `pid` below this unit.
    pub fn floor(&self, pid: u16) -> &[UnitIndex] {
        self.floor
            .get(pid as usize)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn data(&self) -> &[u8] {
        &self.preunit.data
    }

    pub fn rs_data(&self) -> &[u8] {
        &self.preunit.rs_data
    }

    pub fn signature(&self) -> &UnitSignature {
        &self.preunit.signature
    }

    pub fn preunit(&self) -> &Preunit {
        &self.preunit
    }

    pub fn id(&self, n_proc: u16) -> u64 {
        unit_id(self.creator(), self.height, n_proc)
    }
}
