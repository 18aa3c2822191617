#![allow(dead_code)]

use alloy::signers::local::PrivateKeySigner;
use parking_lot::Mutex;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};

use aleph_dag_consensus::{
    adder::Adder,
    alerter::{AlertDag, Alerter},
    config::Config,
    creator::new_unit,
    crypto::{Committee, Hash, Keychain},
    dag::Dag,
    error::AlephError,
    events::{BroadcastEventBus, ConsensusEvent, ConsensusEventBus},
    network::{MemoryNetwork, Network},
    random::{DeterministicBeacon, RandomSource},
    service::DefaultConsensusService,
    syncer::Syncer,
    unit::{Preunit, Unit},
};

pub const WAIT: Duration = Duration::from_secs(10);
pub const SEED: &[u8] = b"aleph test seed";

/// Fresh keys for `n` members, one keychain each.
pub fn keychains(n: u16) -> Vec<Keychain> {
    let signers: Vec<PrivateKeySigner> = (0..n).map(|_| PrivateKeySigner::random()).collect();
    let committee = Arc::new(
        Committee::new(signers.iter().map(|signer| signer.address()).collect())
            .expect("valid committee"),
    );
    signers
        .into_iter()
        .enumerate()
        .map(|(pid, signer)| {
            Keychain::new(pid as u16, signer, Arc::clone(&committee)).expect("valid keychain")
        })
        .collect()
}

pub fn beacon(n: u16) -> Arc<DeterministicBeacon> {
    Arc::new(DeterministicBeacon::new(
        SEED,
        n,
        Config::default().crp_fixed_prefix(),
    ))
}

pub fn new_dag(keychains: &[Keychain], random_source: Arc<dyn RandomSource>) -> Arc<Dag> {
    let dag = Arc::new(Dag::new(
        Arc::clone(keychains[0].committee()),
        Arc::clone(&random_source),
    ));
    random_source.bind(&dag);
    dag
}

/// Let the members take turns creating units on one shared DAG until every
/// member has a unit at `level`. Returns the preunits in creation order.
pub fn grow_dag(dag: &Dag, keychains: &[Keychain], level: u32) -> Vec<Preunit> {
    let mut created = Vec::new();
    loop {
        let lowest = dag
            .maximal_units_per_process()
            .iter()
            .map(|units| units.iter().map(|unit| unit.level()).max())
            .min()
            .flatten();
        if lowest.is_some_and(|lowest| lowest >= level) {
            return created;
        }
        for keychain in keychains {
            match new_unit(dag, keychain, 10, Vec::new()) {
                Ok(preunit) => {
                    dag.add_unit(preunit.clone()).expect("created unit is valid");
                    created.push(preunit);
                }
                Err(AlephError::NoAvailableParents) => {}
                Err(err) => panic!("creating a unit failed: {err}"),
            }
        }
    }
}

/// Sign a unit with hand-picked parents, the creator's predecessor first.
pub fn unit_on(dag: &Dag, keychain: &Keychain, parents: &[&Arc<Unit>], data: &[u8]) -> Preunit {
    let hashes: Vec<Hash> = parents.iter().map(|parent| *parent.hash()).collect();
    let level = {
        let store = dag.read();
        let indices: Vec<_> = parents.iter().map(|parent| parent.index()).collect();
        if indices.is_empty() {
            0
        } else {
            store.level_for(keychain.pid(), &indices)
        }
    };
    let rs_data = dag
        .random_source()
        .data_to_include(keychain.pid(), &hashes, level)
        .expect("random source data");
    Preunit::signed(keychain, hashes, data.to_vec(), rs_data).expect("signed preunit")
}

/// Random source with the identity permutation and a settable coin byte per
/// creator, zero unless set.
#[derive(Default)]
pub struct TestBeacon {
    coins: Mutex<HashMap<u16, u8>>,
}

impl TestBeacon {
    pub fn set_coin(&self, pid: u16, coin: u8) {
        self.coins.lock().insert(pid, coin);
    }
}

impl RandomSource for TestBeacon {
    fn data_to_include(
        &self,
        _creator: u16,
        _parents: &[Hash],
        _level: u32,
    ) -> Result<Vec<u8>, AlephError> {
        Ok(Vec::new())
    }

    fn random_bytes(&self, pid: u16, _level: u32) -> Option<Vec<u8>> {
        Some(vec![self.coins.lock().get(&pid).copied().unwrap_or_default()])
    }

    fn get_crp(&self, _level: u32) -> Vec<u16> {
        (0..4).collect()
    }

    fn check_compliance(&self, _unit: &Unit) -> Result<(), AlephError> {
        Ok(())
    }
}

/// The pieces of one process without the creator loop or outbound workers,
/// so tests decide when units are created and synced.
pub struct Node {
    pub keychain: Keychain,
    pub dag: Arc<Dag>,
    pub alerter: Arc<Alerter<BroadcastEventBus>>,
    pub alert_dag: AlertDag<BroadcastEventBus>,
    pub adder: Adder<BroadcastEventBus>,
    pub syncer: Syncer<BroadcastEventBus>,
    pub events: BroadcastEventBus,
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn cluster(n: u16, config: &Config) -> Vec<Node> {
        let keychains = keychains(n);
        MemoryNetwork::cluster(n)
            .into_iter()
            .zip(keychains.iter())
            .map(|(network, keychain)| Node::new(keychain.clone(), network, config))
            .collect()
    }

    fn new(keychain: Keychain, network: Arc<dyn Network>, config: &Config) -> Self {
        let dag = new_dag(std::slice::from_ref(&keychain), beacon(keychain.n_proc()));
        let events = BroadcastEventBus::default();
        let (stop, stop_rx) = watch::channel(false);
        let alerter = Arc::new(Alerter::new(
            keychain.clone(),
            Arc::clone(&dag),
            Arc::clone(&network),
            config.timeout(),
            events.clone(),
            stop_rx,
        ));
        let alert_dag = AlertDag::new(Arc::clone(&alerter));
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let adder = Adder::new(alert_dag.clone(), config.adder_queue(), fetch_tx);
        let syncer = Syncer::new(adder.clone(), network, config, fetch_rx);
        Self {
            keychain,
            dag,
            alerter,
            alert_dag,
            adder,
            syncer,
            events,
            stop,
            handles: Vec::new(),
        }
    }

    pub fn pid(&self) -> u16 {
        self.keychain.pid()
    }

    /// Run the adder, the alert server and every listener.
    pub fn start(&mut self) {
        self.handles
            .extend(self.adder.start(self.stop.subscribe()).expect("adder starts"));
        self.handles.push(tokio::spawn(
            Arc::clone(&self.alerter).run_server(self.stop.subscribe()),
        ));
        self.handles
            .extend(self.syncer.start_inbound(self.stop.subscribe()));
    }

    /// Also run the fetch and gossip workers.
    pub fn start_outbound(&mut self) {
        self.handles
            .extend(self.syncer.start_outbound(self.stop.subscribe()));
    }

    pub async fn stop(self) {
        self.stop.send_replace(true);
        for handle in self.handles {
            handle.await.expect("task ends cleanly");
        }
    }

    /// Create the next unit on top of this node's DAG and insert it.
    pub fn create(&self) -> Arc<Unit> {
        let preunit = new_unit(&self.dag, &self.keychain, 10, Vec::new()).expect("new unit");
        self.alert_dag.add_unit(preunit).expect("own unit is valid")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.events.subscribe()
    }
}

/// `DefaultConsensusService`s for `n` members connected by memory networks.
pub fn services(n: u16, config: Config) -> Vec<DefaultConsensusService> {
    let keychains = keychains(n);
    MemoryNetwork::cluster(n)
        .into_iter()
        .zip(keychains)
        .map(|(network, keychain)| {
            DefaultConsensusService::new_with_seed(keychain, network, SEED, config.clone())
        })
        .collect()
}

/// Poll `check` until it holds, panicking after [`WAIT`].
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let polled = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Next event matching `wanted`.
pub async fn next_event<F>(
    receiver: &mut broadcast::Receiver<ConsensusEvent>,
    wanted: F,
) -> ConsensusEvent
where
    F: Fn(&ConsensusEvent) -> bool,
{
    within(WAIT, async {
        loop {
            match receiver.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
}

pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    timeout(limit, future).await.expect("finished in time")
}
