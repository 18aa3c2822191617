//! Entry point for preunits received from the network.
//!
//! Each creator has a bounded queue drained by one task, so units of a creator
//! are tried in arrival order. Units created locally go through the same queues.
//! Preunits with unknown parents wait until the parents land; the missing
//! parents are requested from the peer that sent them. When a parent is refused
//! or cannot be fetched, everything waiting on it is dropped.

use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    alerter::AlertDag,
    crypto::Hash,
    error::AlephError,
    events::ConsensusEventBus,
    types::FetchRequest,
    unit::{Preunit, Unit},
};

type Reply = oneshot::Sender<Result<Arc<Unit>, AlephError>>;

/// A preunit and the peer it came from. Own units carry a reply channel.
struct Arrival {
    preunit: Preunit,
    source: u16,
    reply: Option<Reply>,
}

impl Arrival {
    fn received(preunit: Preunit, source: u16) -> Self {
        Self {
            preunit,
            source,
            reply: None,
        }
    }
}

struct Waiting {
    arrival: Arrival,
    missing: usize,
}

/// Preunits waiting for parents, and who waits for which hash.
#[derive(Default)]
struct WaitingRoom {
    waiting: HashMap<Hash, Waiting>,
    children: HashMap<Hash, Vec<Hash>>,
}

impl WaitingRoom {
    fn contains(&self, hash: &Hash) -> bool {
        self.waiting.contains_key(hash)
    }

    /// Park `arrival` until `missing` land. Returns the hashes nobody asked for yet.
    fn park(&mut self, arrival: Arrival, missing: Vec<Hash>) -> Vec<Hash> {
        let hash = *arrival.preunit.hash();
        let mut unrequested = Vec::new();
        for parent in &missing {
            let children = self.children.entry(*parent).or_default();
            if children.is_empty() && !self.waiting.contains_key(parent) {
                unrequested.push(*parent);
            }
            children.push(hash);
        }
        self.waiting.insert(
            hash,
            Waiting {
                arrival,
                missing: missing.len(),
            },
        );
        unrequested
    }

    /// Record that `parent` landed and return the preunits no longer waiting.
    fn release(&mut self, parent: &Hash) -> Vec<Arrival> {
        let mut ready = Vec::new();
        for child in self.children.remove(parent).unwrap_or_default() {
            let Some(waiting) = self.waiting.get_mut(&child) else {
                continue;
            };
            waiting.missing = waiting.missing.saturating_sub(1);
            if waiting.missing == 0 {
                if let Some(waiting) = self.waiting.remove(&child) {
                    ready.push(waiting.arrival);
                }
            }
        }
        ready
    }

    /// Forget `hash` for good, together with every preunit waiting on it
    /// directly or transitively. Returns how many waiting preunits were dropped.
    fn drop_waiting(&mut self, hash: &Hash) -> usize {
        let mut dropped = 0;
        let mut pending = vec![*hash];
        while let Some(hash) = pending.pop() {
            if let Some(waiting) = self.waiting.remove(&hash) {
                dropped += 1;
                for parent in waiting.arrival.preunit.parents() {
                    if let Some(children) = self.children.get_mut(parent) {
                        children.retain(|child| *child != hash);
                        if children.is_empty() {
                            self.children.remove(parent);
                        }
                    }
                }
            }
            pending.extend(self.children.remove(&hash).unwrap_or_default());
        }
        dropped
    }
}

struct Inner<E>
where
    E: ConsensusEventBus,
{
    alert_dag: AlertDag<E>,
    queues: Vec<mpsc::Sender<Arrival>>,
    room: Mutex<WaitingRoom>,
    fetch_requests: mpsc::UnboundedSender<FetchRequest>,
}

/// Pool of per-creator insertion tasks in front of the DAG.
pub struct Adder<E>
where
    E: ConsensusEventBus,
{
    inner: Arc<Inner<E>>,
    receivers: Arc<Mutex<Option<Vec<mpsc::Receiver<Arrival>>>>>,
}

impl<E> Clone for Adder<E>
where
    E: ConsensusEventBus,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            receivers: Arc::clone(&self.receivers),
        }
    }
}

impl<E> Adder<E>
where
    E: ConsensusEventBus,
{
    pub fn new(
        alert_dag: AlertDag<E>,
        queue_capacity: usize,
        fetch_requests: mpsc::UnboundedSender<FetchRequest>,
    ) -> Self {
        let n_proc = alert_dag.dag().n_proc();
        let (queues, receivers): (Vec<_>, Vec<_>) = (0..n_proc)
            .map(|_| mpsc::channel(queue_capacity))
            .unzip();
        Self {
            inner: Arc::new(Inner {
                alert_dag,
                queues,
                room: Mutex::new(WaitingRoom::default()),
                fetch_requests,
            }),
            receivers: Arc::new(Mutex::new(Some(receivers))),
        }
    }

    pub fn alert_dag(&self) -> &AlertDag<E> {
        &self.inner.alert_dag
    }

    /// Number of preunits waiting for parents.
    pub fn waiting_count(&self) -> usize {
        self.inner.room.lock().waiting.len()
    }

    /// Spawn one insertion task per creator. Fails when already started.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>, AlephError> {
        let receivers = self.receivers.lock().take().ok_or_else(|| {
            AlephError::InvalidConfiguration("adder already started".to_string())
        })?;
        let handles = receivers
            .into_iter()
            .enumerate()
            .map(|(creator, mut receiver)| {
                let adder = self.clone();
                let mut stop = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = stop.wait_for(|stopped| *stopped) => break,
                            arrival = receiver.recv() => match arrival {
                                Some(arrival) => adder.insert(arrival),
                                None => break,
                            },
                        }
                    }
                    debug!("Adder for creator {creator} stopped");
                })
            })
            .collect();
        info!("Adder started");
        Ok(handles)
    }

    /// Queue preunits received from `source`. One result per preunit: an error
    /// means the preunit was refused before queueing.
    pub async fn add_preunits(
        &self,
        source: u16,
        preunits: Vec<Preunit>,
    ) -> Vec<Result<(), AlephError>> {
        let mut results = Vec::with_capacity(preunits.len());
        for preunit in preunits {
            let result = match self.precheck(&preunit) {
                Ok(()) => self.enqueue(Arrival::received(preunit, source)).await,
                Err(err) => Err(err),
            };
            results.push(result);
        }
        results
    }

    /// Insert a unit created by this process through its creator's queue.
    pub async fn add_own(&self, preunit: Preunit) -> Result<Arc<Unit>, AlephError> {
        if self.receivers.lock().is_some() {
            return Err(AlephError::ServiceStopped);
        }
        let (reply, response) = oneshot::channel();
        let source = preunit.creator();
        self.enqueue(Arrival {
            preunit,
            source,
            reply: Some(reply),
        })
        .await?;
        response.await.map_err(|_| AlephError::ServiceStopped)?
    }

    /// Give up on parents that could not be fetched. Preunits waiting on them
    /// are dropped, so a later arrival requests the parents again.
    pub fn abandon(&self, hashes: &[Hash]) {
        let mut room = self.inner.room.lock();
        let dropped: usize = hashes.iter().map(|hash| room.drop_waiting(hash)).sum();
        if dropped > 0 {
            debug!("Dropped {dropped} preunits waiting on unfetched parents");
        }
    }

    fn precheck(&self, preunit: &Preunit) -> Result<(), AlephError> {
        let dag = self.inner.alert_dag.dag();
        let creator = preunit.creator();
        if creator >= dag.n_proc() {
            return Err(AlephError::InvalidMember(creator));
        }
        if dag.contains(preunit.hash()) {
            return Err(AlephError::DuplicateUnit(*preunit.hash()));
        }
        if self.inner.room.lock().contains(preunit.hash()) {
            return Err(AlephError::DuplicatePreunit(*preunit.hash()));
        }
        if !dag
            .committee()
            .verify_unit(creator, preunit.hash(), preunit.signature())
        {
            warn!("Dropping preunit {} with a bad signature of {creator}", preunit.hash());
            return Err(AlephError::InvalidUnitSignature { creator });
        }
        Ok(())
    }

    async fn enqueue(&self, arrival: Arrival) -> Result<(), AlephError> {
        let queue = self
            .inner
            .queues
            .get(arrival.preunit.creator() as usize)
            .ok_or(AlephError::InvalidMember(arrival.preunit.creator()))?;
        queue
            .send(arrival)
            .await
            .map_err(|_| AlephError::ServiceStopped)
    }

    /// Queue again without waiting, so insertion tasks never block each other.
    fn requeue(&self, arrival: Arrival) {
        let Some(queue) = self.inner.queues.get(arrival.preunit.creator() as usize) else {
            return;
        };
        let queue = queue.clone();
        tokio::spawn(async move {
            let _ = queue.send(arrival).await;
        });
    }

    fn insert(&self, mut arrival: Arrival) {
        let reply = arrival.reply.take();
        let hash = *arrival.preunit.hash();
        let result = self.inner.alert_dag.add_unit(arrival.preunit.clone());
        match &result {
            Ok(unit) => {
                let ready = self.inner.room.lock().release(unit.hash());
                for child in ready {
                    self.requeue(child);
                }
            }
            Err(AlephError::UnknownParents { missing_count }) if reply.is_none() => {
                debug!("Preunit {hash} waits for {missing_count} parents");
                self.park(arrival);
            }
            Err(AlephError::MissingData(what)) if reply.is_none() => {
                debug!("Preunit {hash} needs {what}");
                self.acquire_commitment(arrival);
            }
            Err(err) if err.is_duplicate() => {}
            Err(err) => {
                warn!("Rejected preunit {hash} from {}: {err}", arrival.source);
                let dropped = self.inner.room.lock().drop_waiting(&hash);
                if dropped > 0 {
                    debug!("Dropped {dropped} preunits waiting on {hash}");
                }
            }
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn park(&self, arrival: Arrival) {
        let dag = self.inner.alert_dag.dag();
        let source = arrival.source;
        let mut room = self.inner.room.lock();
        // Checked under the room lock: a parent inserted later releases us.
        let missing: Vec<Hash> = arrival
            .preunit
            .parents()
            .iter()
            .filter(|parent| !dag.contains(parent))
            .copied()
            .collect();
        if missing.is_empty() {
            drop(room);
            self.requeue(arrival);
            return;
        }
        let unrequested: HashSet<Hash> = room.park(arrival, missing).into_iter().collect();
        drop(room);
        if !unrequested.is_empty() {
            let request = FetchRequest {
                pid: source,
                hashes: unrequested.into_iter().collect(),
            };
            if self.inner.fetch_requests.send(request).is_err() {
                debug!("Fetch service is gone, parents will not be requested");
            }
        }
    }

    /// Ask peers for a commitment to a forker's unit, then try the unit again.
    fn acquire_commitment(&self, arrival: Arrival) {
        let adder = self.clone();
        tokio::spawn(async move {
            let hash = *arrival.preunit.hash();
            let alerter = adder.inner.alert_dag.alerter();
            let n_proc = adder.inner.alert_dag.dag().n_proc();
            let me = alerter.rmc().keychain().pid();
            let source = arrival.source;
            let peers = std::iter::once(source).chain((0..n_proc).filter(move |pid| *pid != source));
            for pid in peers.filter(move |pid| *pid != me) {
                match alerter.request_commitment(&hash, pid).await {
                    Ok(()) => {
                        adder.requeue(arrival);
                        return;
                    }
                    Err(err) => debug!("Commitment to {hash} from {pid}: {err}"),
                }
            }
            debug!("No peer could justify preunit {hash}");
            adder.inner.room.lock().drop_waiting(&hash);
        });
    }
}
