//! Pushing freshly created units to every peer.
//!
//! Message: `sender u16 | preunit`.

use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Semaphore, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    adder::Adder,
    encoding::{read_preunit, write_preunit},
    error::AlephError,
    events::ConsensusEventBus,
    network::{BoxedConnection, Network, Protocol},
    unit::Preunit,
};

pub struct MulticastService<E>
where
    E: ConsensusEventBus,
{
    me: u16,
    n_proc: u16,
    adder: Adder<E>,
    network: Arc<dyn Network>,
    timeout: Duration,
    inbound: Arc<Semaphore>,
    outbound: Arc<Semaphore>,
}

impl<E> Clone for MulticastService<E>
where
    E: ConsensusEventBus,
{
    fn clone(&self) -> Self {
        Self {
            me: self.me,
            n_proc: self.n_proc,
            adder: self.adder.clone(),
            network: Arc::clone(&self.network),
            timeout: self.timeout,
            inbound: Arc::clone(&self.inbound),
            outbound: Arc::clone(&self.outbound),
        }
    }
}

impl<E> MulticastService<E>
where
    E: ConsensusEventBus,
{
    pub fn new(
        adder: Adder<E>,
        network: Arc<dyn Network>,
        timeout: Duration,
        workers: (usize, usize),
    ) -> Self {
        let dag = adder.alert_dag().dag();
        Self {
            me: adder.alert_dag().alerter().rmc().keychain().pid(),
            n_proc: dag.n_proc(),
            adder,
            network,
            timeout,
            inbound: Arc::new(Semaphore::new(workers.0)),
            outbound: Arc::new(Semaphore::new(workers.1)),
        }
    }

    /// Send `preunit` to every other member in the background.
    pub fn multicast(&self, preunit: &Preunit) {
        let preunit = Arc::new(preunit.clone());
        for pid in (0..self.n_proc).filter(|pid| *pid != self.me) {
            let service = self.clone();
            let preunit = Arc::clone(&preunit);
            tokio::spawn(async move {
                let Ok(_permit) = service.outbound.acquire().await else {
                    return;
                };
                match timeout(service.timeout, service.send(pid, &preunit)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!("Multicast of {} to {pid} failed: {err}", preunit.hash()),
                    Err(_) => debug!("Multicast of {} to {pid} timed out", preunit.hash()),
                }
            });
        }
    }

    async fn send(&self, pid: u16, preunit: &Preunit) -> Result<(), AlephError> {
        let mut conn = self.network.dial(pid, Protocol::Multicast).await?;
        conn.write_u16_le(self.me).await?;
        write_preunit(&mut conn, preunit).await?;
        conn.flush().await?;
        Ok(())
    }

    async fn receive(&self, mut conn: BoxedConnection) -> Result<(), AlephError> {
        let sender = conn.read_u16_le().await?;
        let preunit = read_preunit(&mut conn).await?;
        let results = self.adder.add_preunits(sender, vec![preunit]).await;
        match results.into_iter().find_map(Result::err) {
            Some(err) if !err.is_duplicate() => Err(err),
            _ => Ok(()),
        }
    }

    pub fn start_listener(&self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.clone().listen(stop))
    }

    async fn listen(self, mut stop: watch::Receiver<bool>) {
        loop {
            let conn = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                conn = self.network.accept(Protocol::Multicast) => conn,
            };
            let conn = match conn {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Multicast listener stopped: {err}");
                    break;
                }
            };
            let Ok(permit) = Arc::clone(&self.inbound).acquire_owned().await else {
                break;
            };
            let service = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match timeout(service.timeout, service.receive(conn)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!("Multicast unit refused: {err}"),
                    Err(_) => debug!("Receiving multicast timed out"),
                }
            });
        }
        debug!("Multicast listener stopped");
    }
}
