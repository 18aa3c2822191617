//! Notifications about the progress of consensus.
//!
//! Ordering, fork handling and alerts publish [`ConsensusEvent`]s on a
//! [`ConsensusEventBus`]. Publishing never blocks: a bus without subscribers
//! drops events, and slow broadcast subscribers see `Lagged`.

use tokio::sync::broadcast;
use tracing::trace;

use crate::crypto::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// A timing unit was decided and its round was put in linear order.
    TimingRoundOrdered {
        level: u32,
        timing_unit: Hash,
        units: Vec<Hash>,
    },
    /// Two units by `forker` with a common predecessor were seen.
    ForkDetected { forker: u16 },
    /// Our alert about `forker` gathered a quorum and we committed to a unit.
    AlertRaised { forker: u16 },
    /// A commitment chain from a peer allowed a unit of `forker` in.
    CommitmentAcquired { forker: u16, hash: Hash },
}

pub trait ConsensusEventBus: Clone + Send + Sync + 'static {
    /// Handle through which one consumer receives events.
    type Receiver;

    fn subscribe(&self) -> Self::Receiver;
    fn publish(&self, event: ConsensusEvent);
}

/// Event bus over a tokio broadcast channel; every subscriber sees every event
/// published after it subscribed.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<ConsensusEvent>,
}

impl BroadcastEventBus {
    /// Bus keeping up to `capacity` events for its slowest subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(crate::config::Config::default().event_buffer())
    }
}

impl ConsensusEventBus for BroadcastEventBus {
    type Receiver = broadcast::Receiver<ConsensusEvent>;

    fn subscribe(&self) -> Self::Receiver {
        self.sender.subscribe()
    }

    fn publish(&self, event: ConsensusEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!("No subscriber for {event:?}");
        }
    }
}
