//! Pulling specific units from a peer.
//!
//! Request: `kind u8 | count u32 | count * key`, where a key is a unit id
//! (`u64`, kind 0) or a unit hash (32 bytes, kind 1). Response: a chunk of the
//! preunits the peer has for those keys.

use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Mutex, Semaphore, mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    adder::Adder,
    crypto::Hash,
    dag::Dag,
    encoding::{MAX_CHUNK_LEN, read_chunk, read_hash, write_chunk},
    error::AlephError,
    events::ConsensusEventBus,
    network::{BoxedConnection, Network, Protocol},
    types::FetchRequest,
    unit::Preunit,
};

const KIND_IDS: u8 = 0;
const KIND_HASHES: u8 = 1;

pub struct FetchService<E>
where
    E: ConsensusEventBus,
{
    dag: Arc<Dag>,
    adder: Adder<E>,
    network: Arc<dyn Network>,
    timeout: Duration,
    workers: (usize, usize),
    requests: Arc<Mutex<mpsc::UnboundedReceiver<FetchRequest>>>,
}

impl<E> Clone for FetchService<E>
where
    E: ConsensusEventBus,
{
    fn clone(&self) -> Self {
        Self {
            dag: Arc::clone(&self.dag),
            adder: self.adder.clone(),
            network: Arc::clone(&self.network),
            timeout: self.timeout,
            workers: self.workers,
            requests: Arc::clone(&self.requests),
        }
    }
}

impl<E> FetchService<E>
where
    E: ConsensusEventBus,
{
    pub fn new(
        adder: Adder<E>,
        network: Arc<dyn Network>,
        timeout: Duration,
        workers: (usize, usize),
        requests: mpsc::UnboundedReceiver<FetchRequest>,
    ) -> Self {
        Self {
            dag: Arc::clone(adder.alert_dag().dag()),
            adder,
            network,
            timeout,
            workers,
            requests: Arc::new(Mutex::new(requests)),
        }
    }

    /// Fetch the units with the given ids from `pid`.
    pub async fn fetch(&self, pid: u16, ids: &[u64]) -> Result<Vec<Preunit>, AlephError> {
        timeout(self.timeout, async {
            let mut conn = self.network.dial(pid, Protocol::Fetch).await?;
            conn.write_u8(KIND_IDS).await?;
            conn.write_u32_le(ids.len() as u32).await?;
            for id in ids {
                conn.write_u64_le(*id).await?;
            }
            conn.flush().await?;
            read_chunk(&mut conn).await
        })
        .await?
    }

    /// Fetch the units with the given hashes from `pid`.
    pub async fn fetch_hashes(&self, pid: u16, hashes: &[Hash]) -> Result<Vec<Preunit>, AlephError> {
        timeout(self.timeout, async {
            let mut conn = self.network.dial(pid, Protocol::Fetch).await?;
            conn.write_u8(KIND_HASHES).await?;
            conn.write_u32_le(hashes.len() as u32).await?;
            for hash in hashes {
                conn.write_all(hash.as_bytes()).await?;
            }
            conn.flush().await?;
            read_chunk(&mut conn).await
        })
        .await?
    }

    async fn serve(&self, mut conn: BoxedConnection) -> Result<(), AlephError> {
        let kind = conn.read_u8().await?;
        let count = conn.read_u32_le().await? as usize;
        if count > MAX_CHUNK_LEN {
            return Err(AlephError::Decode(format!("fetch request for {count} units")));
        }
        let mut units = Vec::with_capacity(count);
        match kind {
            KIND_IDS => {
                for _ in 0..count {
                    let id = conn.read_u64_le().await?;
                    units.extend(self.dag.get_by_id(id));
                }
            }
            KIND_HASHES => {
                for _ in 0..count {
                    let hash = read_hash(&mut conn).await?;
                    units.extend(self.dag.get(&hash));
                }
            }
            other => return Err(AlephError::Decode(format!("unknown fetch kind {other}"))),
        }
        let preunits: Vec<Preunit> = units.iter().map(|unit| unit.preunit().clone()).collect();
        write_chunk(&mut conn, &preunits).await?;
        conn.flush().await?;
        Ok(())
    }

    /// Spawn the listener; it stops on `stop`.
    pub fn start_listener(&self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.clone().listen(stop))
    }

    /// Spawn the workers that fetch missing parents; they stop on `stop`.
    pub fn start_workers(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.workers.1)
            .map(|_| tokio::spawn(self.clone().work(stop.clone())))
            .collect()
    }

    async fn listen(self, mut stop: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.workers.0));
        loop {
            let conn = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                conn = self.network.accept(Protocol::Fetch) => conn,
            };
            let conn = match conn {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Fetch listener stopped: {err}");
                    break;
                }
            };
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let service = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match timeout(service.timeout, service.serve(conn)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!("Serving fetch failed: {err}"),
                    Err(_) => debug!("Serving fetch timed out"),
                }
            });
        }
        debug!("Fetch listener stopped");
    }

    async fn work(self, mut stop: watch::Receiver<bool>) {
        loop {
            let request = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                request = async { self.requests.lock().await.recv().await } => request,
            };
            let Some(request) = request else { break };
            match self.fetch_hashes(request.pid, &request.hashes).await {
                Ok(preunits) => {
                    debug!("Fetched {} units from {}", preunits.len(), request.pid);
                    let missing: Vec<Hash> = request
                        .hashes
                        .iter()
                        .filter(|hash| preunits.iter().all(|preunit| preunit.hash() != *hash))
                        .copied()
                        .collect();
                    let results = self.adder.add_preunits(request.pid, preunits).await;
                    for err in results.into_iter().filter_map(Result::err) {
                        if !err.is_duplicate() {
                            debug!("Fetched unit refused: {err}");
                        }
                    }
                    if !missing.is_empty() {
                        debug!("{} did not have {} requested units", request.pid, missing.len());
                        self.adder.abandon(&missing);
                    }
                }
                Err(err) => {
                    debug!("Fetching from {} failed: {err}", request.pid);
                    self.adder.abandon(&request.hashes);
                }
            }
        }
        debug!("Fetch worker stopped");
    }
}
