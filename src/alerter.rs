//! Raising and accepting alerts about forkers, and the commitments they produce.
//!
//! A process that sees a fork multicasts the [`ForkingProof`] through [`Rmc`]
//! under `alert_id(forker, raiser)`, committing to the forker's unit it holds.
//! Once a forker is known, its units enter the DAG only with a commitment.

use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    runtime::Handle,
    sync::{Mutex, MutexGuard, watch},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    commitment::{CommitBase, Commitment, RmcProof},
    crypto::{Hash, Keychain},
    dag::{Dag, DagStore, InsertGuard},
    encoding::{MAX_CHUNK_LEN, read_hash, read_preunit, write_preunit},
    error::AlephError,
    events::{ConsensusEvent, ConsensusEventBus},
    forking::ForkingProof,
    network::{BoxedConnection, Network, Protocol},
    rmc::{MessageType, Rmc, RmcStatus, accept_greeting, greet},
    unit::{Preunit, Unit},
    utils::{alert_id, decode_alert_id},
};

const STATUS_OK: u8 = 0;
const STATUS_UNKNOWN_UNIT: u8 = 1;
const STATUS_NO_COMMITMENT: u8 = 2;

fn is_stopped(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

const RETRY_BACKOFF: Duration = Duration::from_millis(20);
const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct Alerter<E>
where
    E: ConsensusEventBus,
{
    keychain: Keychain,
    dag: Arc<Dag>,
    rmc: Rmc,
    network: Arc<dyn Network>,
    commitments: CommitBase,
    /// Serializes raising and accepting alerts per forker.
    locks: Vec<Mutex<()>>,
    timeout: Duration,
    event_bus: E,
    shutdown: watch::Receiver<bool>,
}

impl<E> Alerter<E>
where
    E: ConsensusEventBus,
{
    pub fn new(
        keychain: Keychain,
        dag: Arc<Dag>,
        network: Arc<dyn Network>,
        timeout: Duration,
        event_bus: E,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let locks = (0..keychain.n_proc()).map(|_| Mutex::new(())).collect();
        Self {
            rmc: Rmc::new(keychain.clone()),
            keychain,
            dag,
            network,
            commitments: CommitBase::new(),
            locks,
            timeout,
            event_bus,
            shutdown,
        }
    }

    fn me(&self) -> u16 {
        self.keychain.pid()
    }

    fn n_proc(&self) -> u16 {
        self.keychain.n_proc()
    }

    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    pub fn rmc(&self) -> &Rmc {
        &self.rmc
    }

    pub fn commitments(&self) -> &CommitBase {
        &self.commitments
    }

    pub fn is_forker(&self, pid: u16) -> bool {
        self.commitments.is_forker(pid)
    }

    pub fn commitment_to(&self, hash: &Hash) -> bool {
        self.commitments.get_by_hash(hash).is_some()
    }

    /// Hold the lock that serializes alert handling for `forker`.
    pub async fn lock(&self, forker: u16) -> Result<MutexGuard<'_, ()>, AlephError> {
        let lock = self
            .locks
            .get(forker as usize)
            .ok_or(AlephError::InvalidMember(forker))?;
        Ok(lock.lock().await)
    }

    pub fn alert_id(&self, forker: u16) -> u64 {
        alert_id(forker, self.me(), self.n_proc())
    }

    fn local_maximal(&self, forker: u16) -> Option<Preunit> {
        let store = self.dag.read();
        store
            .maximal_by(forker)
            .first()
            .map(|index| store.unit(*index).preunit().clone())
    }

    /// Multicast `proof` and commit to its committed unit once a quorum signed it.
    ///
    /// Does nothing if we already committed to a unit of this forker.
    pub async fn raise(self: Arc<Self>, proof: ForkingProof) -> Result<(), AlephError> {
        let forker = proof.forker();
        let me = self.me();
        let _guard = self.lock(forker).await?;
        if self.commitments.get_by_parties(me, forker).is_some() {
            return Ok(());
        }

        let id = self.alert_id(forker);
        let data = Arc::new(proof.encode());
        let (done, mut done_rx) = watch::channel(false);
        let done = Arc::new(done);
        info!("Raising alert {id} against forker {forker}");
        for pid in 0..self.n_proc() {
            if pid == me || pid == forker {
                continue;
            }
            let alerter = Arc::clone(&self);
            let data = Arc::clone(&data);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                alerter.send_alert(data, id, pid, done).await;
            });
        }

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = done_rx.wait_for(|finished| *finished) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => return Err(AlephError::ServiceStopped),
        }

        let rmc_proof = self
            .rmc
            .finished(id)
            .map(|(data, signature)| RmcProof { data, signature });
        let commitment = Commitment::base(id, proof.commit().cloned(), rmc_proof);
        self.commitments.add(Arc::new(commitment), me, forker);
        info!("Alert {id} against forker {forker} finished");
        self.event_bus.publish(ConsensusEvent::AlertRaised { forker });
        Ok(())
    }

    async fn send_alert(
        self: Arc<Self>,
        data: Arc<Vec<u8>>,
        id: u64,
        pid: u16,
        done: Arc<watch::Sender<bool>>,
    ) {
        let mut shutdown = self.shutdown.clone();
        let mut backoff = RETRY_BACKOFF;
        let mut signed = false;
        while self.rmc.status(id) != RmcStatus::Finished && !is_stopped(&shutdown) {
            match timeout(self.timeout, self.attempt_gather(&data, id, pid)).await {
                Ok(Ok(completed)) => {
                    signed = true;
                    if completed {
                        done.send_replace(true);
                    }
                    break;
                }
                Ok(Err(err)) => debug!("Alert {id} to {pid} failed: {err}"),
                Err(_) => debug!("Alert {id} to {pid} timed out"),
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
        }

        let mut done_rx = done.subscribe();
        tokio::select! {
            _ = done_rx.wait_for(|finished| *finished) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => return,
        }
        // A peer without our data gets it together with the proof.
        let message_type = if signed {
            MessageType::Proving
        } else {
            MessageType::Finished
        };
        match timeout(self.timeout, self.attempt_prove(id, pid, message_type)).await {
            Ok(Ok(())) => debug!("Sent proof of alert {id} to {pid}"),
            Ok(Err(err)) => debug!("Sending proof of alert {id} to {pid} failed: {err}"),
            Err(_) => debug!("Sending proof of alert {id} to {pid} timed out"),
        }
    }

    async fn attempt_gather(&self, data: &[u8], id: u64, pid: u16) -> Result<bool, AlephError> {
        let mut conn = self.network.dial(pid, Protocol::Alert).await?;
        greet(&mut conn, self.me(), id, MessageType::Sending).await?;
        self.rmc.send_data(id, data, &mut conn).await?;
        conn.flush().await?;
        self.rmc.accept_signature(id, pid, &mut conn).await
    }

    async fn attempt_prove(
        &self,
        id: u64,
        pid: u16,
        message_type: MessageType,
    ) -> Result<(), AlephError> {
        let mut conn = self.network.dial(pid, Protocol::Alert).await?;
        greet(&mut conn, self.me(), id, message_type).await?;
        if message_type == MessageType::Finished {
            self.rmc.send_finished(id, &mut conn).await?;
        } else {
            self.rmc.send_proof(id, &mut conn).await?;
        }
        conn.flush().await?;
        Ok(())
    }

    /// Serve alert connections until the inbound phase of shutdown.
    pub async fn run_server(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                conn = self.network.accept(Protocol::Alert) => match conn {
                    Ok(conn) => {
                        let alerter = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = alerter.handle_incoming(conn).await {
                                debug!("Alert connection failed: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("Alert listener stopped: {err}");
                        break;
                    }
                },
            }
        }
    }

    /// Handle one inbound connection: an alert, a proof, or a commitment request.
    pub async fn handle_incoming(self: Arc<Self>, mut conn: BoxedConnection) -> Result<(), AlephError> {
        let (pid, id, message_type) = timeout(self.timeout, accept_greeting(&mut conn)).await??;
        match message_type {
            MessageType::Sending => {
                timeout(self.timeout, self.accept_alert(id, pid, &mut conn)).await?
            }
            MessageType::Proving => timeout(self.timeout, self.rmc.accept_proof(id, &mut conn)).await?,
            MessageType::Request => {
                timeout(self.timeout, self.handle_commitment_request(&mut conn)).await?
            }
            MessageType::Finished => {
                timeout(self.timeout, self.accept_finished_alert(id, pid, &mut conn)).await?
            }
        }
    }

    async fn accept_alert(
        self: &Arc<Self>,
        id: u64,
        pid: u16,
        conn: &mut BoxedConnection,
    ) -> Result<(), AlephError> {
        let forker = self.check_raiser(id, pid)?;
        let data = self.rmc.accept_data(id, pid, conn).await?;
        let proof = self.note_alert(id, pid, forker, &data)?;
        self.rmc.send_signature(id, conn).await?;
        conn.flush().await?;
        info!("Accepted alert {id} from {pid} against forker {forker}");
        self.follow_alert(proof);
        Ok(())
    }

    /// An alert whose quorum finished before we signed it.
    async fn accept_finished_alert(
        self: &Arc<Self>,
        id: u64,
        pid: u16,
        conn: &mut BoxedConnection,
    ) -> Result<(), AlephError> {
        let forker = self.check_raiser(id, pid)?;
        let data = self.rmc.accept_finished(id, pid, conn).await?;
        let proof = self.note_alert(id, pid, forker, &data)?;
        info!("Accepted finished alert {id} from {pid} against forker {forker}");
        self.follow_alert(proof);
        Ok(())
    }

    fn check_raiser(&self, id: u64, pid: u16) -> Result<u16, AlephError> {
        let (forker, raiser) = decode_alert_id(id, self.n_proc())?;
        if raiser != pid {
            return Err(AlephError::InvalidAlertId(id));
        }
        Ok(forker)
    }

    /// Check the forking proof in `data` and record the raiser's commitment.
    fn note_alert(
        &self,
        id: u64,
        raiser: u16,
        forker: u16,
        data: &[u8],
    ) -> Result<ForkingProof, AlephError> {
        let proof = ForkingProof::decode(data)?;
        proof.check(forker, self.keychain.committee())?;
        let commitment = Commitment::base(id, proof.commit().cloned(), None);
        self.commitments.add(Arc::new(commitment), raiser, forker);
        Ok(proof)
    }

    /// Raise our own alert about the same forker unless we already committed.
    fn follow_alert(self: &Arc<Self>, proof: ForkingProof) {
        let forker = proof.forker();
        if self.commitments.get_by_parties(self.me(), forker).is_some() {
            return;
        }
        let proof = proof.with_commit(self.local_maximal(forker));
        let alerter = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = alerter.raise(proof).await {
                debug!("Raising alert against {forker} stopped: {err}");
            }
        });
    }

    async fn handle_commitment_request(&self, conn: &mut BoxedConnection) -> Result<(), AlephError> {
        let hash = read_hash(conn).await?;
        let commitment = match self.commitments.get_by_hash(&hash) {
            Some(commitment) => Ok(commitment),
            None if !self.dag.contains(&hash) => Err(STATUS_UNKNOWN_UNIT),
            None => self.produce_commitment_for(&hash).map_err(|err| {
                debug!("No commitment for {hash}: {err}");
                STATUS_NO_COMMITMENT
            }),
        };
        let commitment = commitment.and_then(|commitment| {
            match self.rmc.status(commitment.rmc_id()) {
                RmcStatus::Finished => Ok(commitment),
                _ => Err(STATUS_NO_COMMITMENT),
            }
        });
        let commitment = match commitment {
            Ok(commitment) => commitment,
            Err(status) => {
                conn.write_u8(status).await?;
                conn.flush().await?;
                return Err(AlephError::MissingData(format!("commitment to {hash}")));
            }
        };

        let chain = commitment.chain();
        conn.write_u8(STATUS_OK).await?;
        conn.write_u64_le(commitment.rmc_id()).await?;
        conn.write_u32_le(chain.len() as u32).await?;
        for preunit in &chain {
            write_preunit(conn, preunit).await?;
        }
        self.rmc.send_finished(commitment.rmc_id(), conn).await?;
        conn.flush().await?;
        debug!("Sent commitment chain of {} units for {hash}", chain.len());
        Ok(())
    }

    /// Derive a commitment to a unit below our own committed unit of its creator.
    fn produce_commitment_for(&self, hash: &Hash) -> Result<Arc<Commitment>, AlephError> {
        let store = self.dag.read();
        let target = store
            .index_of(hash)
            .ok_or_else(|| AlephError::MissingData(format!("unit {hash}")))?;
        let target_height = store.unit(target).height();
        let forker = store.unit(target).creator();
        let mut commitment = self
            .commitments
            .get_by_parties(self.me(), forker)
            .ok_or_else(|| {
                AlephError::InvalidCommitment("we are not aware of any forks here".to_string())
            })?;
        let committed = commitment
            .hash()
            .and_then(|committed| store.index_of(committed))
            .ok_or_else(|| {
                AlephError::InvalidCommitment("we did not commit to anything".to_string())
            })?;
        if store.chain_at_height(committed, target_height) != Some(target) {
            return Err(AlephError::InvalidCommitment(
                "unit is not below our committed unit".to_string(),
            ));
        }
        let mut current = committed;
        while store.unit(current).height() > target_height {
            let pred = store.unit(current).predecessor().ok_or_else(|| {
                AlephError::InvalidCommitment("chain ended above the unit".to_string())
            })?;
            let next = Arc::new(commitment.commitment_for_parent(store.unit(pred).preunit())?);
            self.commitments.add(Arc::clone(&next), self.me(), forker);
            commitment = next;
            current = pred;
        }
        Ok(commitment)
    }

    /// Ask `pid` for a commitment chain ending at the unit `hash`, verify and store it.
    pub async fn request_commitment(&self, hash: &Hash, pid: u16) -> Result<(), AlephError> {
        timeout(self.timeout, self.fetch_commitment(hash, pid)).await?
    }

    async fn fetch_commitment(&self, hash: &Hash, pid: u16) -> Result<(), AlephError> {
        let mut conn = self.network.dial(pid, Protocol::Alert).await?;
        greet(&mut conn, self.me(), 0, MessageType::Request).await?;
        conn.write_all(hash.as_bytes()).await?;
        conn.flush().await?;

        match conn.read_u8().await? {
            STATUS_OK => {}
            STATUS_UNKNOWN_UNIT => {
                return Err(AlephError::MissingData(format!("{pid} does not know {hash}")));
            }
            _ => {
                return Err(AlephError::MissingData(format!(
                    "{pid} has no commitment to {hash}"
                )));
            }
        }
        let id = conn.read_u64_le().await?;
        let (forker, raiser) = decode_alert_id(id, self.n_proc())?;
        let count = conn.read_u32_le().await? as usize;
        if count == 0 || count > MAX_CHUNK_LEN {
            return Err(AlephError::Decode(format!("commitment chain of {count} units")));
        }
        let mut chain = Vec::with_capacity(count);
        for _ in 0..count {
            chain.push(read_preunit(&mut conn).await?);
        }
        self.rmc.accept_finished(id, raiser, &mut conn).await?;
        let (data, signature) = self
            .rmc
            .finished(id)
            .ok_or_else(|| AlephError::Rmc(format!("instance {id} did not finish")))?;

        self.check_chain(&chain, forker, hash)?;
        let mut commitment = Arc::new(Commitment::base(
            id,
            Some(chain[0].clone()),
            Some(RmcProof { data, signature }),
        ));
        commitment.check_proof(self.keychain.committee())?;
        self.commitments.add(Arc::clone(&commitment), raiser, forker);
        for preunit in &chain[1..] {
            commitment = Arc::new(commitment.commitment_for_parent(preunit)?);
            self.commitments.add(Arc::clone(&commitment), raiser, forker);
        }
        info!("Acquired commitment to {hash} of forker {forker} from {pid}");
        self.event_bus.publish(ConsensusEvent::CommitmentAcquired {
            forker,
            hash: *hash,
        });
        Ok(())
    }

    /// Each preunit is signed by `forker` and is the self-predecessor of the
    /// previous one; the last one is the requested unit.
    fn check_chain(&self, chain: &[Preunit], forker: u16, hash: &Hash) -> Result<(), AlephError> {
        let committee = self.keychain.committee();
        for preunit in chain {
            if preunit.creator() != forker
                || !committee.verify_unit(forker, preunit.hash(), preunit.signature())
            {
                return Err(AlephError::InvalidCommitment(format!(
                    "chain unit {} is not a signed unit of {forker}",
                    preunit.hash()
                )));
            }
        }
        for pair in chain.windows(2) {
            if pair[0].predecessor() != Some(pair[1].hash()) {
                return Err(AlephError::InvalidCommitment(
                    "chain is not a self-predecessor chain".to_string(),
                ));
            }
        }
        if chain.last().map(Preunit::hash) != Some(hash) {
            return Err(AlephError::InvalidCommitment(
                "chain does not end at the requested unit".to_string(),
            ));
        }
        Ok(())
    }
}

/// DAG front door that detects forks and keeps known forkers' units out
/// unless a commitment covers them.
pub struct AlertDag<E>
where
    E: ConsensusEventBus,
{
    alerter: Arc<Alerter<E>>,
}

impl<E> Clone for AlertDag<E>
where
    E: ConsensusEventBus,
{
    fn clone(&self) -> Self {
        Self {
            alerter: Arc::clone(&self.alerter),
        }
    }
}

impl<E> AlertDag<E>
where
    E: ConsensusEventBus,
{
    pub fn new(alerter: Arc<Alerter<E>>) -> Self {
        Self { alerter }
    }

    pub fn alerter(&self) -> &Arc<Alerter<E>> {
        &self.alerter
    }

    pub fn dag(&self) -> &Arc<Dag> {
        self.alerter.dag()
    }

    pub fn add_unit(&self, preunit: Preunit) -> Result<Arc<Unit>, AlephError> {
        self.alerter.dag().add_unit_guarded(preunit, self)
    }

    fn report_fork(&self, proof: ForkingProof) {
        let forker = proof.forker();
        warn!(
            "Fork by {forker}: {} and {} share a predecessor",
            proof.u().hash(),
            proof.v().hash()
        );
        self.alerter
            .event_bus
            .publish(ConsensusEvent::ForkDetected { forker });
        if let Ok(handle) = Handle::try_current() {
            let alerter = Arc::clone(&self.alerter);
            handle.spawn(async move {
                if let Err(err) = alerter.raise(proof).await {
                    debug!("Raising alert against {forker} stopped: {err}");
                }
            });
        }
    }
}

impl<E> InsertGuard for AlertDag<E>
where
    E: ConsensusEventBus,
{
    fn check(&self, store: &DagStore, unit: &Unit) -> Result<(), AlephError> {
        let creator = unit.creator();
        let missing = || AlephError::MissingData("commitment to fork".to_string());
        if self.alerter.is_forker(creator) {
            if self.alerter.commitment_to(unit.hash()) {
                return Ok(());
            }
            return Err(missing());
        }
        for max in store.maximal_by(creator) {
            if store.unit(*max).height() < unit.height() {
                continue;
            }
            if let Some(proof) = ForkingProof::find(store, unit, *max) {
                self.report_fork(proof);
                return Err(missing());
            }
        }
        Ok(())
    }
}
