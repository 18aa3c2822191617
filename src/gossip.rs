//! Periodic DAG exchange with one peer at a time.
//!
//! 1. The initiator sends its pid and its [`DagInfo`].
//! 2. The responder answers with its own `DagInfo` and the units the initiator lacks.
//! 3. The initiator sends the units the responder lacks.
//!
//! When the responder reported several tips of one creator, that creator
//! forked, and the initiator fetches commitments for the tips it does not know
//! before adding the received units.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Semaphore, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, warn};

use crate::{
    adder::Adder,
    crypto::Hash,
    dag::{Dag, DagStore},
    encoding::{read_chunk, read_message, write_chunk, write_message},
    error::AlephError,
    events::ConsensusEventBus,
    network::{BoxedConnection, Network, Protocol},
    unit::Preunit,
};

/// Highest units of one creator.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CreatorTip {
    #[prost(uint32, tag = "1")]
    pub creator: u32,
    /// Height of the highest units; meaningless when `hashes` is empty.
    #[prost(uint32, tag = "2")]
    pub height: u32,
    /// Hashes of the maximal units; more than one means a fork.
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub hashes: Vec<Vec<u8>>,
}

/// Summary of a DAG: the tips of every creator.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DagInfo {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<CreatorTip>,
}

impl DagInfo {
    pub fn of(store: &DagStore) -> Self {
        let entries = (0..store.n_proc())
            .map(|creator| {
                let maximal = store.maximal_by(creator);
                let height = maximal
                    .iter()
                    .map(|index| store.unit(*index).height())
                    .max()
                    .unwrap_or(0);
                CreatorTip {
                    creator: creator as u32,
                    height,
                    hashes: maximal
                        .iter()
                        .map(|index| store.unit(*index).hash().as_bytes().to_vec())
                        .collect(),
                }
            })
            .collect();
        Self { entries }
    }

    fn tip_hashes(tip: &CreatorTip) -> Vec<Hash> {
        tip.hashes
            .iter()
            .filter_map(|bytes| Hash::from_slice(bytes).ok())
            .collect()
    }

    /// Units of `store` the owner of this summary does not have, parents first.
    pub fn missing_in(&self, store: &DagStore) -> Vec<Preunit> {
        let mut units = Vec::new();
        for creator in 0..store.n_proc() {
            let tip = self.entries.iter().find(|tip| tip.creator == creator as u32);
            let (height, known) = match tip {
                Some(tip) if !tip.hashes.is_empty() => {
                    (Some(tip.height), Self::tip_hashes(tip))
                }
                _ => (None, Vec::new()),
            };
            if let Some(height) = height {
                // Our branches of a fork at the peer's top height.
                units.extend(
                    store
                        .units_above_height(creator, height.checked_sub(1))
                        .into_iter()
                        .filter(|unit| unit.height() == height && !known.contains(unit.hash())),
                );
            }
            units.extend(store.units_above_height(creator, height));
        }
        units.sort_by_key(|unit| (unit.level(), unit.height()));
        units.iter().map(|unit| unit.preunit().clone()).collect()
    }

    /// Tip hashes of forked creators that `dag` lacks.
    pub fn unknown_fork_tips(&self, dag: &Dag) -> Vec<Hash> {
        self.entries
            .iter()
            .filter(|tip| tip.hashes.len() > 1)
            .flat_map(Self::tip_hashes)
            .filter(|hash| !dag.contains(hash))
            .collect()
    }
}

pub struct GossipService<E>
where
    E: ConsensusEventBus,
{
    me: u16,
    dag: Arc<Dag>,
    adder: Adder<E>,
    network: Arc<dyn Network>,
    timeout: Duration,
    interval: Duration,
    workers: (usize, usize),
    next_peer: Arc<AtomicU16>,
}

impl<E> Clone for GossipService<E>
where
    E: ConsensusEventBus,
{
    fn clone(&self) -> Self {
        Self {
            me: self.me,
            dag: Arc::clone(&self.dag),
            adder: self.adder.clone(),
            network: Arc::clone(&self.network),
            timeout: self.timeout,
            interval: self.interval,
            workers: self.workers,
            next_peer: Arc::clone(&self.next_peer),
        }
    }
}

impl<E> GossipService<E>
where
    E: ConsensusEventBus,
{
    pub fn new(
        adder: Adder<E>,
        network: Arc<dyn Network>,
        timeout: Duration,
        interval: Duration,
        workers: (usize, usize),
    ) -> Self {
        let dag = Arc::clone(adder.alert_dag().dag());
        let me = adder.alert_dag().alerter().rmc().keychain().pid();
        Self {
            me,
            next_peer: Arc::new(AtomicU16::new(me)),
            dag,
            adder,
            network,
            timeout,
            interval,
            workers,
        }
    }

    /// Peers in round-robin order, never ourselves.
    fn next_peer(&self) -> u16 {
        let n_proc = self.dag.n_proc();
        loop {
            let pid = self.next_peer.fetch_add(1, Ordering::Relaxed) % n_proc;
            if pid != self.me {
                return pid;
            }
        }
    }

    /// Run one exchange with `pid`.
    pub async fn gossip(&self, pid: u16) -> Result<(), AlephError> {
        let (theirs, received) = timeout(self.timeout, async {
            let mut conn = self.network.dial(pid, Protocol::Gossip).await?;
            let ours = DagInfo::of(&self.dag.read());
            conn.write_u16_le(self.me).await?;
            write_message(&mut conn, &ours).await?;
            conn.flush().await?;

            let theirs: DagInfo = read_message(&mut conn).await?;
            let received = read_chunk(&mut conn).await?;

            let missing = theirs.missing_in(&self.dag.read());
            write_chunk(&mut conn, &missing).await?;
            conn.flush().await?;
            Ok::<_, AlephError>((theirs, received))
        })
        .await??;

        let alerter = self.adder.alert_dag().alerter();
        for hash in theirs.unknown_fork_tips(&self.dag) {
            if let Err(err) = alerter.request_commitment(&hash, pid).await {
                debug!("No commitment to fork tip {hash} from {pid}: {err}");
            }
        }
        self.add(pid, received).await;
        Ok(())
    }

    async fn add(&self, pid: u16, preunits: Vec<Preunit>) {
        if preunits.is_empty() {
            return;
        }
        debug!("Gossip with {pid} brought {} units", preunits.len());
        let results = self.adder.add_preunits(pid, preunits).await;
        for err in results.into_iter().filter_map(Result::err) {
            if !err.is_duplicate() {
                debug!("Gossiped unit from {pid} refused: {err}");
            }
        }
    }

    /// Returns the initiator and the units it sent.
    async fn serve(&self, mut conn: BoxedConnection) -> Result<(u16, Vec<Preunit>), AlephError> {
        let pid = conn.read_u16_le().await?;
        let theirs: DagInfo = read_message(&mut conn).await?;
        let (ours, missing) = {
            let store = self.dag.read();
            (DagInfo::of(&store), theirs.missing_in(&store))
        };
        write_message(&mut conn, &ours).await?;
        write_chunk(&mut conn, &missing).await?;
        conn.flush().await?;
        Ok((pid, read_chunk(&mut conn).await?))
    }

    /// Spawn the listener; it stops on `stop`.
    pub fn start_listener(&self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.clone().listen(stop))
    }

    /// Spawn the outbound workers; they stop on `stop`.
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
                conn = self.network.accept(Protocol::Gossip) => conn,
            };
            let conn = match conn {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Gossip listener stopped: {err}");
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
                    Ok(Ok((pid, received))) => service.add(pid, received).await,
                    Ok(Err(err)) => debug!("Serving gossip failed: {err}"),
                    Err(_) => debug!("Serving gossip timed out"),
                }
            });
        }
        debug!("Gossip listener stopped");
    }

    async fn work(self, mut stop: watch::Receiver<bool>) {
        loop {
            let pid = self.next_peer();
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                result = self.gossip(pid) => {
                    if let Err(err) = result {
                        debug!("Gossip with {pid} failed: {err}");
                    }
                }
            }
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                _ = sleep(self.interval) => {}
            }
        }
        debug!("Gossip worker stopped");
    }
}
