//! Ordering service: decides timing units as the DAG grows and publishes the
//! resulting timing rounds.

use futures::Stream;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    dag::Dag,
    error::AlephError,
    events::ConsensusEventBus,
    ordering::{RoundSorter, TimingDecider},
    types::TimingRound,
    unit::Unit,
};

pub struct Extender<E>
where
    E: ConsensusEventBus,
{
    dag: Arc<Dag>,
    config: Config,
    event_bus: E,
    rounds: broadcast::Sender<TimingRound>,
    trigger: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    timing_units: Arc<Mutex<Vec<Arc<Unit>>>>,
}

impl<E> Extender<E>
where
    E: ConsensusEventBus,
{
    /// Create the service and hook it to prime-unit insertions of `dag`.
    pub fn new(dag: Arc<Dag>, config: &Config, event_bus: E) -> Self {
        let (trigger, trigger_rx) = mpsc::channel(1);
        let (rounds, _) = broadcast::channel(config.event_buffer());
        let on_prime = trigger.clone();
        dag.after_insert(Box::new(move |unit| {
            if unit.is_prime() {
                // A full channel already holds a wake-up.
                let _ = on_prime.try_send(());
            }
        }));
        Self {
            dag,
            config: config.clone(),
            event_bus,
            rounds,
            trigger,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            timing_units: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Timing units decided so far, lowest level first.
    pub fn timing_units(&self) -> Vec<Arc<Unit>> {
        self.timing_units.lock().clone()
    }

    /// Stream of timing rounds decided after the call.
    pub fn ordered_rounds(&self) -> impl Stream<Item = TimingRound> + Send + 'static {
        let mut receiver = self.rounds.subscribe();
        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(round) => yield round,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Ordered rounds subscriber lagged, {skipped} rounds lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Spawn the decider and the round sorter. Fails when already started.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>, AlephError> {
        let mut trigger_rx = self.trigger_rx.lock().take().ok_or_else(|| {
            AlephError::InvalidConfiguration("ordering service already started".to_string())
        })?;
        let (decided_tx, mut decided_rx) = mpsc::unbounded_channel::<Arc<Unit>>();

        let mut decider = TimingDecider::new(Arc::clone(&self.dag), &self.config);
        let timing_units = Arc::clone(&self.timing_units);
        let mut stop = shutdown.clone();
        let decider_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    wake = trigger_rx.recv() => {
                        if wake.is_none() {
                            break;
                        }
                        while let Some(timing_unit) = decider.decide_timing() {
                            timing_units.lock().push(Arc::clone(&timing_unit));
                            if decided_tx.send(timing_unit).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            debug!("Timing decider stopped");
        });

        let mut sorter = RoundSorter::new(Arc::clone(&self.dag));
        let rounds = self.rounds.clone();
        let event_bus = self.event_bus.clone();
        let mut stop = shutdown;
        let sorter_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    decided = decided_rx.recv() => {
                        let Some(timing_unit) = decided else { break };
                        let round = sorter.timing_round(timing_unit.level(), timing_unit);
                        info!(
                            "Ordered timing round {} with {} units",
                            round.level,
                            round.units.len()
                        );
                        event_bus.publish(round.to_event());
                        let _ = rounds.send(round);
                    }
                }
            }
            debug!("Round sorter stopped");
        });

        // Units inserted before the start count too.
        let _ = self.trigger.try_send(());
        Ok(vec![decider_task, sorter_task])
    }
}
