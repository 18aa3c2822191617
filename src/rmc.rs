//! Reliable multicast of arbitrary data.
//!
//! A sender multicasts data under an id, collects signatures from a quorum and
//! turns them into a proof. Anyone holding data with a valid proof knows that
//! no other data can finish under the same id.
//!
//! Wire formats, integers little-endian:
//! - greeting: `pid u16 | id u64 | type u8`
//! - data: `len u32 | data | sender signature [65]`
//! - signature: `[65]`
//! - proof: `len u32 | multisignature`
//! - finished: data frame without the signature, then a proof frame

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{
    crypto::{Committee, Keychain, MESSAGE_SIGNATURE_LEN, MessageSignature, MultiSignature},
    encoding::{MAX_DATA_LEN, MAX_FRAME_LEN, read_bytes, write_bytes},
    error::AlephError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmcStatus {
    Unknown,
    /// Data known, not signed by us yet.
    Data,
    Signed,
    /// Data known together with a quorum proof.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Sending = 0,
    Proving = 1,
    Request = 2,
    /// Data and proof in one message, for peers that never signed.
    Finished = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = AlephError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Sending),
            1 => Ok(MessageType::Proving),
            2 => Ok(MessageType::Request),
            3 => Ok(MessageType::Finished),
            other => Err(AlephError::Decode(format!("unknown rmc message type {other}"))),
        }
    }
}

pub async fn greet<W>(
    writer: &mut W,
    pid: u16,
    id: u64,
    message_type: MessageType,
) -> Result<(), AlephError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_u16_le(pid).await?;
    writer.write_u64_le(id).await?;
    writer.write_u8(message_type as u8).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn accept_greeting<R>(reader: &mut R) -> Result<(u16, u64, MessageType), AlephError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let pid = reader.read_u16_le().await?;
    let id = reader.read_u64_le().await?;
    let message_type = MessageType::try_from(reader.read_u8().await?)?;
    Ok((pid, id, message_type))
}

fn signed_message(id: u64, data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(8 + data.len());
    message.extend_from_slice(&id.to_le_bytes());
    message.extend_from_slice(data);
    message
}

#[derive(Debug)]
struct Incoming {
    sender: u16,
    data: Vec<u8>,
    proof: Option<MultiSignature>,
    status: RmcStatus,
}

#[derive(Debug)]
struct Outgoing {
    data: Vec<u8>,
    own_signature: MessageSignature,
    signatures: MultiSignature,
    status: RmcStatus,
}

/// State of every multicast instance this process takes part in.
pub struct Rmc {
    keychain: Keychain,
    incoming: Mutex<HashMap<u64, Incoming>>,
    outgoing: Mutex<HashMap<u64, Outgoing>>,
}

impl Rmc {
    pub fn new(keychain: Keychain) -> Self {
        Self {
            keychain,
            incoming: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
        }
    }

    pub fn keychain(&self) -> &Keychain {
        &self.keychain
    }

    /// Start (or repeat) multicasting `data` under `id` by writing the data frame.
    ///
    /// Once an instance exists its original data is sent, whatever `data` is passed.
    pub async fn send_data<W>(&self, id: u64, data: &[u8], writer: &mut W) -> Result<(), AlephError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (data, signature) = {
            let mut outgoing = self.outgoing.lock();
            if let Some(instance) = outgoing.get(&id) {
                (instance.data.clone(), instance.own_signature)
            } else {
                let signature = self.keychain.sign_message(&signed_message(id, data))?;
                let mut signatures = MultiSignature::new();
                signatures.add(self.keychain.pid(), signature);
                let status = if signatures.is_complete(self.keychain.committee()) {
                    RmcStatus::Finished
                } else {
                    RmcStatus::Data
                };
                outgoing.insert(
                    id,
                    Outgoing {
                        data: data.to_vec(),
                        own_signature: signature,
                        signatures,
                        status,
                    },
                );
                (data.to_vec(), signature)
            }
        };
        write_bytes(writer, &data).await?;
        writer.write_all(&signature).await?;
        Ok(())
    }

    /// Read a data frame sent by `pid` for instance `id` and return the data.
    ///
    /// Repeated identical frames are accepted; conflicting data for a known id is not.
    pub async fn accept_data<R>(&self, id: u64, pid: u16, reader: &mut R) -> Result<Vec<u8>, AlephError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let data = read_bytes(reader, MAX_DATA_LEN).await?;
        let mut signature = [0u8; MESSAGE_SIGNATURE_LEN];
        reader.read_exact(&mut signature).await?;
        if !self
            .keychain
            .committee()
            .verify_message(pid, &signed_message(id, &data), &signature)
        {
            return Err(AlephError::Rmc(format!(
                "wrong data signature from {pid} for instance {id}"
            )));
        }
        let mut incoming = self.incoming.lock();
        match incoming.get(&id) {
            Some(instance) if instance.sender == pid && instance.data == data => {}
            Some(_) => {
                return Err(AlephError::Rmc(format!(
                    "conflicting data for instance {id}"
                )));
            }
            None => {
                incoming.insert(
                    id,
                    Incoming {
                        sender: pid,
                        data: data.clone(),
                        proof: None,
                        status: RmcStatus::Data,
                    },
                );
            }
        }
        Ok(data)
    }

    /// Sign the data received for `id` and write the signature.
    pub async fn send_signature<W>(&self, id: u64, writer: &mut W) -> Result<(), AlephError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let signature = {
            let mut incoming = self.incoming.lock();
            let instance = incoming
                .get_mut(&id)
                .ok_or_else(|| AlephError::Rmc(format!("cannot sign unknown instance {id}")))?;
            let signature = self
                .keychain
                .sign_message(&signed_message(id, &instance.data))?;
            if instance.status == RmcStatus::Data {
                instance.status = RmcStatus::Signed;
            }
            signature
        };
        writer.write_all(&signature).await?;
        Ok(())
    }

    /// Read a signature of `pid` over our data for `id`.
    ///
    /// Returns true exactly when this signature completed the quorum.
    pub async fn accept_signature<R>(&self, id: u64, pid: u16, reader: &mut R) -> Result<bool, AlephError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut signature = [0u8; MESSAGE_SIGNATURE_LEN];
        reader.read_exact(&mut signature).await?;
        let mut outgoing = self.outgoing.lock();
        let instance = outgoing
            .get_mut(&id)
            .ok_or_else(|| AlephError::Rmc(format!("unknown outgoing instance {id}")))?;
        let committee = self.keychain.committee();
        if !committee.verify_message(pid, &signed_message(id, &instance.data), &signature) {
            return Err(AlephError::Rmc(format!(
                "wrong signature from {pid} for instance {id}"
            )));
        }
        if instance.status == RmcStatus::Finished {
            return Ok(false);
        }
        instance.signatures.add(pid, signature);
        if instance.signatures.is_complete(committee) {
            instance.status = RmcStatus::Finished;
            debug!("RMC instance {id} gathered a quorum of signatures");
            return Ok(true);
        }
        Ok(false)
    }

    /// Write the proof of a finished outgoing instance.
    pub async fn send_proof<W>(&self, id: u64, writer: &mut W) -> Result<(), AlephError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let proof = {
            let outgoing = self.outgoing.lock();
            match outgoing.get(&id) {
                Some(instance) if instance.status == RmcStatus::Finished => {
                    instance.signatures.encode()
                }
                _ => return Err(AlephError::Rmc(format!("no proof to send for {id}"))),
            }
        };
        write_bytes(writer, &proof).await
    }

    /// Read and verify the proof for data we already accepted under `id`.
    pub async fn accept_proof<R>(&self, id: u64, reader: &mut R) -> Result<(), AlephError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let bytes = read_bytes(reader, MAX_FRAME_LEN).await?;
        let proof = MultiSignature::decode(&bytes)?;
        let mut incoming = self.incoming.lock();
        let instance = incoming
            .get_mut(&id)
            .ok_or_else(|| AlephError::Rmc(format!("cannot accept proof of unknown data {id}")))?;
        if !proof.verify(self.keychain.committee(), &signed_message(id, &instance.data)) {
            return Err(AlephError::Rmc(format!("wrong multisignature for {id}")));
        }
        instance.proof = Some(proof);
        instance.status = RmcStatus::Finished;
        Ok(())
    }

    /// Write data and proof of a finished instance, incoming or outgoing.
    pub async fn send_finished<W>(&self, id: u64, writer: &mut W) -> Result<(), AlephError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (data, proof) = self
            .finished(id)
            .ok_or_else(|| AlephError::Rmc(format!("instance {id} is not finished")))?;
        write_bytes(writer, &data).await?;
        write_bytes(writer, &proof.encode()).await
    }

    /// Read data and proof for `id`, as sent by [`Rmc::send_finished`].
    pub async fn accept_finished<R>(&self, id: u64, pid: u16, reader: &mut R) -> Result<Vec<u8>, AlephError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let data = read_bytes(reader, MAX_DATA_LEN).await?;
        let proof = MultiSignature::decode(&read_bytes(reader, MAX_FRAME_LEN).await?)?;
        if !proof.verify(self.keychain.committee(), &signed_message(id, &data)) {
            return Err(AlephError::Rmc(format!("wrong multisignature for {id}")));
        }
        let mut incoming = self.incoming.lock();
        match incoming.get_mut(&id) {
            Some(instance) if instance.data != data => {
                return Err(AlephError::Rmc(format!(
                    "finished data differs from accepted data for {id}"
                )));
            }
            Some(instance) => {
                instance.proof = Some(proof);
                instance.status = RmcStatus::Finished;
            }
            None => {
                incoming.insert(
                    id,
                    Incoming {
                        sender: pid,
                        data: data.clone(),
                        proof: Some(proof),
                        status: RmcStatus::Finished,
                    },
                );
            }
        }
        Ok(data)
    }

    pub fn status(&self, id: u64) -> RmcStatus {
        if let Some(instance) = self.incoming.lock().get(&id) {
            return instance.status;
        }
        self.outgoing
            .lock()
            .get(&id)
            .map_or(RmcStatus::Unknown, |instance| instance.status)
    }

    /// Data known for `id`. Only reliable once the status is `Finished`.
    pub fn data(&self, id: u64) -> Option<Vec<u8>> {
        if let Some(instance) = self.incoming.lock().get(&id) {
            return Some(instance.data.clone());
        }
        self.outgoing
            .lock()
            .get(&id)
            .map(|instance| instance.data.clone())
    }

    /// Data and proof of a finished instance.
    pub fn finished(&self, id: u64) -> Option<(Vec<u8>, MultiSignature)> {
        if let Some(instance) = self.incoming.lock().get(&id) {
            if let Some(proof) = &instance.proof {
                return Some((instance.data.clone(), proof.clone()));
            }
        }
        self.outgoing.lock().get(&id).and_then(|instance| {
            (instance.status == RmcStatus::Finished)
                .then(|| (instance.data.clone(), instance.signatures.clone()))
        })
    }
}

/// Check a proof for `data` multicast under `id`.
pub fn verify_proof(committee: &Committee, id: u64, data: &[u8], proof: &MultiSignature) -> bool {
    proof.verify(committee, &signed_message(id, data))
}
