//! Everything that moves units between processes: gossip, fetch and multicast,
//! all feeding the [`Adder`].

use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    adder::Adder,
    config::Config,
    error::AlephError,
    events::ConsensusEventBus,
    fetch::FetchService,
    gossip::GossipService,
    multicast::MulticastService,
    network::Network,
    types::FetchRequest,
    unit::Preunit,
};

pub struct Syncer<E>
where
    E: ConsensusEventBus,
{
    fetch: FetchService<E>,
    gossip: GossipService<E>,
    multicast: MulticastService<E>,
}

impl<E> Syncer<E>
where
    E: ConsensusEventBus,
{
    /// `fetch_requests` receives the missing-parent requests of `adder`.
    pub fn new(
        adder: Adder<E>,
        network: Arc<dyn Network>,
        config: &Config,
        fetch_requests: mpsc::UnboundedReceiver<FetchRequest>,
    ) -> Self {
        Self {
            fetch: FetchService::new(
                adder.clone(),
                Arc::clone(&network),
                config.timeout(),
                config.fetch_workers(),
                fetch_requests,
            ),
            gossip: GossipService::new(
                adder.clone(),
                Arc::clone(&network),
                config.timeout(),
                config.gossip_interval(),
                config.gossip_workers(),
            ),
            multicast: MulticastService::new(
                adder,
                network,
                config.timeout(),
                config.multicast_workers(),
            ),
        }
    }

    /// Pull units by id from `pid`.
    pub async fn fetch(&self, pid: u16, unit_ids: &[u64]) -> Result<Vec<Preunit>, AlephError> {
        self.fetch.fetch(pid, unit_ids).await
    }

    /// Exchange DAG summaries and missing units with `pid`.
    pub async fn gossip(&self, pid: u16) -> Result<(), AlephError> {
        self.gossip.gossip(pid).await
    }

    /// Push a unit we created to every peer.
    pub fn multicast(&self, preunit: &Preunit) {
        self.multicast.multicast(preunit);
    }

    /// Spawn the outbound workers of gossip and fetch.
    pub fn start_outbound(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = self.fetch.start_workers(stop.clone());
        handles.extend(self.gossip.start_workers(stop));
        handles
    }

    /// Spawn the gossip, fetch and multicast listeners.
    pub fn start_inbound(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.fetch.start_listener(stop.clone()),
            self.gossip.start_listener(stop.clone()),
            self.multicast.start_listener(stop),
        ]
    }
}
