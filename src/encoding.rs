//! Wire format of preunits and of the framed messages built from them.
//!
//! A preunit is encoded as
//! `creator u16 | signature [64] | n u16 | n * parent hash [32] | data_len u32 | data | rs_len u32 | rs_data`,
//! integers little-endian. A missing preunit is the two bytes `0xFFFF`.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    crypto::{HASH_LEN, Hash, UNIT_SIGNATURE_LEN},
    error::AlephError,
    unit::Preunit,
};

/// Creator value marking an absent preunit.
pub const NIL_CREATOR: u16 = u16::MAX;
pub const MAX_PARENTS: usize = 1 << 12;
pub const MAX_DATA_LEN: usize = 1 << 22;
pub const MAX_CHUNK_LEN: usize = 1 << 16;
pub const MAX_FRAME_LEN: usize = 1 << 24;

pub fn encode_preunit(preunit: &Preunit) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        2 + UNIT_SIGNATURE_LEN
            + 2
            + preunit.parents().len() * HASH_LEN
            + 8
            + preunit.data().len()
            + preunit.rs_data().len(),
    );
    out.extend_from_slice(&preunit.creator().to_le_bytes());
    out.extend_from_slice(preunit.signature());
    out.extend_from_slice(&(preunit.parents().len() as u16).to_le_bytes());
    for parent in preunit.parents() {
        out.extend_from_slice(parent.as_bytes());
    }
    out.extend_from_slice(&(preunit.data().len() as u32).to_le_bytes());
    out.extend_from_slice(preunit.data());
    out.extend_from_slice(&(preunit.rs_data().len() as u32).to_le_bytes());
    out.extend_from_slice(preunit.rs_data());
    out
}

pub fn encode_optional_preunit(preunit: Option<&Preunit>) -> Vec<u8> {
    match preunit {
        Some(preunit) => encode_preunit(preunit),
        None => NIL_CREATOR.to_le_bytes().to_vec(),
    }
}

/// Cursor over a byte slice that fails with [`AlephError::Decode`] on truncation.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], AlephError> {
        if self.remaining() < len {
            return Err(AlephError::Decode(format!(
                "need {len} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn u16(&mut self) -> Result<u16, AlephError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, AlephError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn u64(&mut self) -> Result<u64, AlephError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn hash(&mut self) -> Result<Hash, AlephError> {
        Hash::from_slice(self.take(HASH_LEN)?)
    }

    fn bounded_len(&mut self, max: usize, what: &str) -> Result<usize, AlephError> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(AlephError::Decode(format!("{what} too long: {len}")));
        }
        Ok(len)
    }

    /// Read a preunit, or `None` for the nil marker.
    pub fn optional_preunit(&mut self) -> Result<Option<Preunit>, AlephError> {
        let creator = self.u16()?;
        if creator == NIL_CREATOR {
            return Ok(None);
        }
        let mut signature = [0u8; UNIT_SIGNATURE_LEN];
        signature.copy_from_slice(self.take(UNIT_SIGNATURE_LEN)?);
        let n_parents = self.u16()? as usize;
        if n_parents > MAX_PARENTS {
            return Err(AlephError::Decode(format!("too many parents: {n_parents}")));
        }
        let mut parents = Vec::with_capacity(n_parents);
        for _ in 0..n_parents {
            parents.push(checked_parent(self.hash()?)?);
        }
        let data_len = self.bounded_len(MAX_DATA_LEN, "data")?;
        let data = self.take(data_len)?.to_vec();
        let rs_len = self.bounded_len(MAX_DATA_LEN, "random source data")?;
        let rs_data = self.take(rs_len)?.to_vec();
        Ok(Some(Preunit::new(creator, parents, data, rs_data, signature)))
    }

    pub fn preunit(&mut self) -> Result<Preunit, AlephError> {
        self.optional_preunit()?
            .ok_or_else(|| AlephError::Decode("unexpected nil preunit".to_string()))
    }
}

fn checked_parent(hash: Hash) -> Result<Hash, AlephError> {
    if hash.is_zero() {
        return Err(AlephError::Decode("zero parent hash".to_string()));
    }
    Ok(hash)
}

pub fn decode_preunit(bytes: &[u8]) -> Result<Preunit, AlephError> {
    let mut reader = ByteReader::new(bytes);
    let preunit = reader.preunit()?;
    if reader.remaining() != 0 {
        return Err(AlephError::Decode(format!(
            "{} trailing bytes after preunit",
            reader.remaining()
        )));
    }
    Ok(preunit)
}

pub async fn write_preunit<W>(writer: &mut W, preunit: &Preunit) -> Result<(), AlephError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode_preunit(preunit)).await?;
    Ok(())
}

pub async fn read_optional_preunit<R>(reader: &mut R) -> Result<Option<Preunit>, AlephError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let creator = reader.read_u16_le().await?;
    if creator == NIL_CREATOR {
        return Ok(None);
    }
    let mut signature = [0u8; UNIT_SIGNATURE_LEN];
    reader.read_exact(&mut signature).await?;
    let n_parents = reader.read_u16_le().await? as usize;
    if n_parents > MAX_PARENTS {
        return Err(AlephError::Decode(format!("too many parents: {n_parents}")));
    }
    let mut parents = Vec::with_capacity(n_parents);
    for _ in 0..n_parents {
        parents.push(checked_parent(read_hash(reader).await?)?);
    }
    let data = read_bytes(reader, MAX_DATA_LEN).await?;
    let rs_data = read_bytes(reader, MAX_DATA_LEN).await?;
    Ok(Some(Preunit::new(creator, parents, data, rs_data, signature)))
}

pub async fn read_preunit<R>(reader: &mut R) -> Result<Preunit, AlephError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_optional_preunit(reader)
        .await?
        .ok_or_else(|| AlephError::Decode("unexpected nil preunit".to_string()))
}

/// Write `count u32` followed by the preunits.
pub async fn write_chunk<W>(writer: &mut W, preunits: &[Preunit]) -> Result<(), AlephError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_u32_le(preunits.len() as u32).await?;
    for preunit in preunits {
        write_preunit(writer, preunit).await?;
    }
    Ok(())
}

pub async fn read_chunk<R>(reader: &mut R) -> Result<Vec<Preunit>, AlephError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let count = reader.read_u32_le().await? as usize;
    if count > MAX_CHUNK_LEN {
        return Err(AlephError::Decode(format!("chunk too long: {count}")));
    }
    let mut preunits = Vec::with_capacity(count);
    for _ in 0..count {
        preunits.push(read_preunit(reader).await?);
    }
    Ok(preunits)
}

pub async fn read_hash<R>(reader: &mut R) -> Result<Hash, AlephError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hash = [0u8; HASH_LEN];
    reader.read_exact(&mut hash).await?;
    Ok(Hash(hash))
}

/// Read a `len u32` prefixed byte string of at most `max` bytes.
pub async fn read_bytes<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, AlephError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32_le().await? as usize;
    if len > max {
        return Err(AlephError::Decode(format!("frame too long: {len}")));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_bytes<W>(writer: &mut W, bytes: &[u8]) -> Result<(), AlephError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_u32_le(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), AlephError>
where
    W: AsyncWrite + Unpin + ?Sized,
    M: Message,
{
    write_bytes(writer, &message.encode_to_vec()).await
}

pub async fn read_message<R, M>(reader: &mut R) -> Result<M, AlephError>
where
    R: AsyncRead + Unpin + ?Sized,
    M: Message + Default,
{
    let bytes = read_bytes(reader, MAX_FRAME_LEN).await?;
    Ok(M::decode(bytes.as_slice())?)
}
