use futures::Stream;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    adder::Adder,
    alerter::{AlertDag, Alerter},
    config::Config,
    creator::{DataSource, EmptyData, new_unit},
    crypto::Keychain,
    dag::Dag,
    error::AlephError,
    events::{BroadcastEventBus, ConsensusEventBus},
    extender::Extender,
    network::Network,
    random::{DeterministicBeacon, RandomSource},
    syncer::Syncer,
    types::TimingRound,
    unit::Unit,
};

/// Shutdown signals, fired in field order.
struct Shutdown {
    outbound: watch::Sender<bool>,
    inbound: watch::Sender<bool>,
    core: watch::Sender<bool>,
}

#[derive(Default)]
struct Tasks {
    outbound: Vec<JoinHandle<()>>,
    inbound: Vec<JoinHandle<()>>,
    core: Vec<JoinHandle<()>>,
}

struct Inner<E>
where
    E: ConsensusEventBus,
{
    keychain: Keychain,
    config: Config,
    alert_dag: AlertDag<E>,
    adder: Adder<E>,
    syncer: Syncer<E>,
    extender: Extender<E>,
    data_source: Mutex<Arc<dyn DataSource>>,
    event_bus: E,
    shutdown: Shutdown,
    tasks: Mutex<Option<Tasks>>,
    inserted: Arc<Notify>,
}

/// One committee member: its DAG, the services around it and the creator loop.
pub struct ConsensusService<E = BroadcastEventBus>
where
    E: ConsensusEventBus,
{
    inner: Arc<Inner<E>>,
}

impl<E> Clone for ConsensusService<E>
where
    E: ConsensusEventBus,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub type DefaultConsensusService = ConsensusService<BroadcastEventBus>;

impl DefaultConsensusService {
    pub fn new_default(
        keychain: Keychain,
        network: Arc<dyn Network>,
        random_source: Arc<dyn RandomSource>,
        config: Config,
    ) -> Self {
        let event_bus = BroadcastEventBus::new(config.event_buffer());
        Self::new_with_components(keychain, network, random_source, config, event_bus)
    }

    /// Like [`Self::new_default`], with a [`DeterministicBeacon`] built from
    /// `seed` and the configured fixed prefix of the permutations.
    pub fn new_with_seed(
        keychain: Keychain,
        network: Arc<dyn Network>,
        seed: &[u8],
        config: Config,
    ) -> Self {
        let beacon = DeterministicBeacon::new(seed, keychain.n_proc(), config.crp_fixed_prefix());
        Self::new_default(keychain, network, Arc::new(beacon), config)
    }
}

impl<E> ConsensusService<E>
where
    E: ConsensusEventBus,
{
    pub fn new_with_components(
        keychain: Keychain,
        network: Arc<dyn Network>,
        random_source: Arc<dyn RandomSource>,
        config: Config,
        event_bus: E,
    ) -> Self {
        let dag = Arc::new(Dag::new(
            Arc::clone(keychain.committee()),
            Arc::clone(&random_source),
        ));
        random_source.bind(&dag);

        let (outbound, _) = watch::channel(false);
        let (inbound, _) = watch::channel(false);
        let (core, core_rx) = watch::channel(false);

        let alerter = Arc::new(Alerter::new(
            keychain.clone(),
            Arc::clone(&dag),
            Arc::clone(&network),
            config.timeout(),
            event_bus.clone(),
            core_rx,
        ));
        let alert_dag = AlertDag::new(alerter);
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let adder = Adder::new(alert_dag.clone(), config.adder_queue(), fetch_tx);
        let syncer = Syncer::new(adder.clone(), network, &config, fetch_rx);
        let extender = Extender::new(Arc::clone(&dag), &config, event_bus.clone());

        let inserted = Arc::new(Notify::new());
        let on_insert = Arc::clone(&inserted);
        dag.after_insert(Box::new(move |_| on_insert.notify_one()));

        Self {
            inner: Arc::new(Inner {
                keychain,
                config,
                alert_dag,
                adder,
                syncer,
                extender,
                data_source: Mutex::new(Arc::new(EmptyData)),
                event_bus,
                shutdown: Shutdown {
                    outbound,
                    inbound,
                    core,
                },
                tasks: Mutex::new(None),
                inserted,
            }),
        }
    }

    /// Replace the payload source of the creator loop.
    pub fn set_data_source(&self, data_source: Arc<dyn DataSource>) {
        *self.inner.data_source.lock() = data_source;
    }

    pub fn pid(&self) -> u16 {
        self.inner.keychain.pid()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn dag(&self) -> &Arc<Dag> {
        self.inner.alert_dag.dag()
    }

    pub fn alerter(&self) -> &Arc<Alerter<E>> {
        self.inner.alert_dag.alerter()
    }

    pub fn adder(&self) -> &Adder<E> {
        &self.inner.adder
    }

    pub fn syncer(&self) -> &Syncer<E> {
        &self.inner.syncer
    }

    pub fn subscribe_to_events(&self) -> E::Receiver {
        self.inner.event_bus.subscribe()
    }

    /// Timing rounds ordered from now on.
    pub fn ordered_rounds(&self) -> impl Stream<Item = TimingRound> + Send + 'static {
        self.inner.extender.ordered_rounds()
    }

    pub fn timing_units(&self) -> Vec<Arc<Unit>> {
        self.inner.extender.timing_units()
    }

    /// Spawn every service and the creator loop.
    pub fn start(&self) -> Result<(), AlephError> {
        let mut tasks = self.inner.tasks.lock();
        if tasks.is_some() {
            return Err(AlephError::InvalidConfiguration(
                "service already started".to_string(),
            ));
        }
        let shutdown = &self.inner.shutdown;
        let mut started = Tasks::default();

        started.core.extend(self.inner.adder.start(shutdown.core.subscribe())?);
        started
            .core
            .extend(self.inner.extender.start(shutdown.core.subscribe())?);
        let service = self.clone();
        let stop = shutdown.core.subscribe();
        started
            .core
            .push(tokio::spawn(async move { service.create_units(stop).await }));

        let alerter = Arc::clone(self.alerter());
        started
            .inbound
            .push(tokio::spawn(alerter.run_server(shutdown.inbound.subscribe())));
        started
            .inbound
            .extend(self.inner.syncer.start_inbound(shutdown.inbound.subscribe()));
        started
            .outbound
            .extend(self.inner.syncer.start_outbound(shutdown.outbound.subscribe()));

        *tasks = Some(started);
        info!("Consensus service of process {} started", self.pid());
        Ok(())
    }

    /// Stop outbound workers, then listeners, then the core tasks.
    pub async fn stop(&self) {
        let Some(tasks) = self.inner.tasks.lock().take() else {
            return;
        };
        let shutdown = &self.inner.shutdown;
        for (signal, handles) in [
            (&shutdown.outbound, tasks.outbound),
            (&shutdown.inbound, tasks.inbound),
            (&shutdown.core, tasks.core),
        ] {
            signal.send_replace(true);
            for handle in handles {
                if let Err(err) = handle.await {
                    warn!("Task ended abnormally: {err}");
                }
            }
        }
        info!("Consensus service of process {} stopped", self.pid());
    }

    fn own_level(&self) -> Option<u32> {
        let dag = self.dag();
        let store = dag.read();
        store
            .maximal_by(self.pid())
            .iter()
            .map(|index| store.unit(*index).level())
            .max()
    }

    /// Create, add and multicast a unit; `NoAvailableParents` when the DAG
    /// does not allow a new one yet. The unit is inserted by the adder task of
    /// this process, so it never races copies of our units coming from peers.
    pub async fn create_unit(&self) -> Result<Arc<Unit>, AlephError> {
        let data = self.inner.data_source.lock().get_data();
        let preunit = new_unit(
            self.dag(),
            &self.inner.keychain,
            self.inner.config.max_parents(),
            data,
        )?;
        let unit = self.inner.adder.add_own(preunit).await?;
        self.inner.syncer.multicast(unit.preunit());
        Ok(unit)
    }

    async fn create_units(&self, mut stop: watch::Receiver<bool>) {
        let config = &self.inner.config;
        loop {
            if let (Some(limit), Some(level)) = (config.level_limit(), self.own_level()) {
                if level >= limit {
                    info!("Process {} reached level limit {limit}", self.pid());
                    break;
                }
            }
            match self.create_unit().await {
                Ok(unit) => debug!(
                    "Created unit {} at height {} level {}",
                    unit.hash(),
                    unit.height(),
                    unit.level()
                ),
                Err(AlephError::NoAvailableParents) => {
                    tokio::select! {
                        _ = stop.wait_for(|stopped| *stopped) => break,
                        _ = self.inner.inserted.notified() => {}
                    }
                    continue;
                }
                Err(err) => warn!("Creating a unit failed: {err}"),
            }
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                _ = sleep(config.create_delay()) => {}
            }
        }
        debug!("Creator loop stopped");
    }
}
