use std::time::Duration;

use crate::{error::AlephError, utils::validate_workers};

/// Protocol and service parameters shared by every component of a process.
///
/// Start from [`Config::default`] and adjust with the validating `with_*` setters.
#[derive(Debug, Clone)]
pub struct Config {
    /// How many parents the creator tries to give every unit.
    max_parents: usize,
    /// Distance between a candidate's level and the level of its first votes.
    voting_level: u32,
    /// Number of voting levels after which a decision is forced with the common coin.
    pi_delta_level: u32,
    /// Number of leading positions of the common permutation that only rotate the committee.
    crp_fixed_prefix: u16,
    /// The first level that produces a timing round.
    order_start_level: u32,
    /// Inbound and outbound gossip workers.
    gossip_workers: (usize, usize),
    /// Inbound and outbound fetch workers.
    fetch_workers: (usize, usize),
    /// Concurrent inbound and outbound multicast transfers.
    multicast_workers: (usize, usize),
    /// Pause between two gossip rounds of one outbound worker.
    gossip_interval: Duration,
    /// Upper bound for every network operation.
    timeout: Duration,
    /// Pause between unit creation attempts.
    create_delay: Duration,
    /// Stop creating units once this level is reached.
    level_limit: Option<u32>,
    /// Capacity of each per-creator adder queue.
    adder_queue: usize,
    /// Capacity of the event bus and of the ordered-rounds channel.
    event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parents: 10,
            voting_level: 3,
            pi_delta_level: 60,
            crp_fixed_prefix: 5,
            order_start_level: 0,
            gossip_workers: (20, 15),
            fetch_workers: (4, 2),
            multicast_workers: (10, 10),
            gossip_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(2),
            create_delay: Duration::from_millis(100),
            level_limit: None,
            adder_queue: 32,
            event_buffer: 1000,
        }
    }
}

impl Config {
    /// A configuration tuned for in-process clusters: short delays, few workers.
    pub fn local() -> Self {
        Self {
            gossip_workers: (4, 2),
            fetch_workers: (2, 1),
            multicast_workers: (4, 4),
            gossip_interval: Duration::from_millis(20),
            timeout: Duration::from_millis(500),
            create_delay: Duration::from_millis(10),
            ..Self::default()
        }
    }

    pub fn with_max_parents(mut self, max_parents: usize) -> Result<Self, AlephError> {
        if max_parents < 2 {
            return Err(AlephError::InvalidConfiguration(
                "max_parents must be at least 2".to_string(),
            ));
        }
        self.max_parents = max_parents;
        Ok(self)
    }

    pub fn with_voting_level(mut self, voting_level: u32) -> Result<Self, AlephError> {
        if voting_level == 0 {
            return Err(AlephError::InvalidConfiguration(
                "voting_level must be positive".to_string(),
            ));
        }
        self.voting_level = voting_level;
        Ok(self)
    }

    pub fn with_pi_delta_level(mut self, pi_delta_level: u32) -> Result<Self, AlephError> {
        if pi_delta_level == 0 {
            return Err(AlephError::InvalidConfiguration(
                "pi_delta_level must be positive".to_string(),
            ));
        }
        self.pi_delta_level = pi_delta_level;
        Ok(self)
    }

    pub fn with_crp_fixed_prefix(mut self, crp_fixed_prefix: u16) -> Self {
        self.crp_fixed_prefix = crp_fixed_prefix;
        self
    }

    pub fn with_order_start_level(mut self, order_start_level: u32) -> Self {
        self.order_start_level = order_start_level;
        self
    }

    pub fn with_gossip_workers(mut self, workers: (usize, usize)) -> Result<Self, AlephError> {
        validate_workers("gossip", workers)?;
        self.gossip_workers = workers;
        Ok(self)
    }

    pub fn with_fetch_workers(mut self, workers: (usize, usize)) -> Result<Self, AlephError> {
        validate_workers("fetch", workers)?;
        self.fetch_workers = workers;
        Ok(self)
    }

    pub fn with_multicast_workers(mut self, workers: (usize, usize)) -> Result<Self, AlephError> {
        validate_workers("multicast", workers)?;
        self.multicast_workers = workers;
        Ok(self)
    }

    pub fn with_gossip_interval(mut self, gossip_interval: Duration) -> Self {
        self.gossip_interval = gossip_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, AlephError> {
        if timeout.is_zero() {
            return Err(AlephError::InvalidConfiguration(
                "timeout must be positive".to_string(),
            ));
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn with_create_delay(mut self, create_delay: Duration) -> Self {
        self.create_delay = create_delay;
        self
    }

    pub fn with_level_limit(mut self, level_limit: Option<u32>) -> Self {
        self.level_limit = level_limit;
        self
    }

    pub fn with_adder_queue(mut self, adder_queue: usize) -> Result<Self, AlephError> {
        if adder_queue == 0 {
            return Err(AlephError::InvalidConfiguration(
                "adder_queue must be positive".to_string(),
            ));
        }
        self.adder_queue = adder_queue;
        Ok(self)
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Result<Self, AlephError> {
        if event_buffer == 0 {
            return Err(AlephError::InvalidConfiguration(
                "event_buffer must be positive".to_string(),
            ));
        }
        self.event_buffer = event_buffer;
        Ok(self)
    }

    pub fn max_parents(&self) -> usize {
        self.max_parents
    }

    pub fn voting_level(&self) -> u32 {
        self.voting_level
    }

    pub fn pi_delta_level(&self) -> u32 {
        self.pi_delta_level
    }

    pub fn crp_fixed_prefix(&self) -> u16 {
        self.crp_fixed_prefix
    }

    pub fn order_start_level(&self) -> u32 {
        self.order_start_level
    }

    pub fn gossip_workers(&self) -> (usize, usize) {
        self.gossip_workers
    }

    pub fn fetch_workers(&self) -> (usize, usize) {
        self.fetch_workers
    }

    pub fn multicast_workers(&self) -> (usize, usize) {
        self.multicast_workers
    }

    pub fn gossip_interval(&self) -> Duration {
        self.gossip_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn create_delay(&self) -> Duration {
        self.create_delay
    }

    pub fn level_limit(&self) -> Option<u32> {
        self.level_limit
    }

    pub fn adder_queue(&self) -> usize {
        self.adder_queue
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer
    }
}
