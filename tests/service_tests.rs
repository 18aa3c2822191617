mod common;

use futures::StreamExt;
use std::{sync::Arc, time::Duration};

use aleph_dag_consensus::{
    config::Config,
    creator::DataSource,
    crypto::Hash,
    error::AlephError,
    events::ConsensusEvent,
    random::{DeterministicBeacon, RandomSource},
};

use common::{SEED, WAIT, eventually, next_event, services, within};

const LEVEL_LIMIT: u32 = 8;
const ROUNDS: usize = 2;

struct Tagged(u16);

impl DataSource for Tagged {
    fn get_data(&self) -> Vec<u8> {
        format!("batch from {}", self.0).into_bytes()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_orders_the_same_rounds() {
    let config = Config::local().with_level_limit(Some(LEVEL_LIMIT));
    let cluster = services(4, config);
    let mut streams: Vec<_> = cluster
        .iter()
        .map(|service| Box::pin(service.ordered_rounds()))
        .collect();
    let mut events = cluster[0].subscribe_to_events();
    for service in &cluster {
        service.set_data_source(Arc::new(Tagged(service.pid())));
        service.start().expect("service starts");
    }

    let mut orders: Vec<Vec<(Hash, Vec<Hash>)>> = Vec::new();
    for stream in &mut streams {
        let mut rounds = Vec::new();
        for _ in 0..ROUNDS {
            let round = within(WAIT, stream.next()).await.expect("stream is open");
            rounds.push((*round.timing_unit.hash(), round.hashes()));
        }
        orders.push(rounds);
    }
    for (pid, order) in orders.iter().enumerate().skip(1) {
        assert_eq!(order, &orders[0], "process {pid} ordered differently");
    }

    let event = next_event(&mut events, |event| {
        matches!(event, ConsensusEvent::TimingRoundOrdered { .. })
    })
    .await;
    let ConsensusEvent::TimingRoundOrdered {
        level, timing_unit, ..
    } = event
    else {
        unreachable!("filtered above");
    };
    assert_eq!(level, 0);
    assert_eq!(timing_unit, orders[0][0].0);

    let payload = cluster[0]
        .dag()
        .get(&orders[0][1].0)
        .expect("timing unit is in the DAG")
        .data()
        .to_vec();
    assert!(payload.starts_with(b"batch from "));

    for service in &cluster {
        service.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_creator_respects_the_level_limit() {
    let config = Config::local().with_level_limit(Some(3));
    let cluster = services(4, config);
    for service in &cluster {
        service.start().expect("service starts");
    }

    eventually("every process reaches the limit", || {
        cluster.iter().all(|service| {
            let dag = service.dag();
            let store = dag.read();
            store
                .maximal_by(service.pid())
                .iter()
                .any(|index| store.unit(*index).level() >= 3)
        })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    for service in &cluster {
        let dag = service.dag();
        let store = dag.read();
        let at_limit = store
            .units()
            .filter(|unit| unit.creator() == service.pid() && unit.level() >= 3)
            .count();
        assert_eq!(at_limit, 1, "process {} kept creating", service.pid());
    }

    for service in &cluster {
        service.stop().await;
    }
}

#[tokio::test]
async fn test_start_twice_and_stop_twice() {
    let cluster = services(4, Config::local().with_level_limit(Some(0)));
    let service = &cluster[0];

    service.start().expect("first start");
    let err = service.start().expect_err("second start refused");
    assert!(matches!(err, AlephError::InvalidConfiguration(_)));

    within(WAIT, service.stop()).await;
    within(WAIT, service.stop()).await;
}

#[tokio::test]
async fn test_create_unit_by_hand() {
    let cluster = services(4, Config::local().with_level_limit(Some(0)));
    let service = &cluster[1];

    let err = service.create_unit().await.expect_err("adder is not running");
    assert!(matches!(err, AlephError::ServiceStopped));
    assert!(service.dag().read().is_empty(), "nothing inserted before start");

    service.start().expect("service starts");
    eventually("the creator loop adds the dealing unit", || {
        service.dag().read().len() == 1
    })
    .await;
    let dealing = service.dag().read().units().next().cloned().expect("one unit");
    assert!(dealing.is_dealing());
    assert_eq!(dealing.creator(), 1);

    let err = within(WAIT, service.create_unit())
        .await
        .expect_err("no parents yet");
    assert!(matches!(err, AlephError::NoAvailableParents));
    assert!(service.timing_units().is_empty());

    service.stop().await;
    let err = service.create_unit().await.expect_err("adder has stopped");
    assert!(matches!(err, AlephError::NoAvailableParents | AlephError::ServiceStopped));
}

#[tokio::test]
async fn test_seeded_service_uses_the_configured_permutation_prefix() {
    let config = Config::local().with_crp_fixed_prefix(2);
    let cluster = services(4, config);
    let expected = DeterministicBeacon::new(SEED, 4, 2);
    let other = DeterministicBeacon::new(SEED, 4, 0);

    let random_source = cluster[0].dag().random_source();
    for level in [0, 1, 7] {
        assert_eq!(random_source.get_crp(level), expected.get_crp(level));
    }
    assert!(
        (0..8).any(|level| random_source.get_crp(level) != other.get_crp(level)),
        "the prefix changes the permutations"
    );
}

#[test]
fn test_config_setters_validate() {
    assert!(Config::default().with_max_parents(1).is_err());
    assert!(Config::default().with_voting_level(0).is_err());
    assert!(Config::default().with_pi_delta_level(0).is_err());
    assert!(Config::default().with_gossip_workers((0, 1)).is_err());
    assert!(Config::default().with_fetch_workers((1, 0)).is_err());
    assert!(Config::default().with_multicast_workers((0, 0)).is_err());
    assert!(Config::default().with_timeout(Duration::ZERO).is_err());
    assert!(Config::default().with_adder_queue(0).is_err());
    assert!(Config::default().with_event_buffer(0).is_err());

    let config = Config::default()
        .with_max_parents(4)
        .and_then(|config| config.with_voting_level(2))
        .and_then(|config| config.with_fetch_workers((3, 3)))
        .expect("valid values accepted");
    assert_eq!(config.max_parents(), 4);
    assert_eq!(config.voting_level(), 2);
    assert_eq!(config.fetch_workers(), (3, 3));
    assert_eq!(config.pi_delta_level(), Config::default().pi_delta_level());
}

#[test]
fn test_local_config_is_faster() {
    let local = Config::local();
    let default = Config::default();
    assert!(local.create_delay() < default.create_delay());
    assert!(local.timeout() < default.timeout());
    assert_eq!(local.voting_level(), default.voting_level());
    assert_eq!(local.level_limit(), None);
}
