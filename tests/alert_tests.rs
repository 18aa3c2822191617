mod common;

use aleph_dag_consensus::{
    config::Config,
    error::AlephError,
    events::ConsensusEvent,
    rmc::RmcStatus,
    utils::alert_id,
};

use common::{Node, eventually, next_event, unit_on};

#[tokio::test]
async fn test_fork_is_detected_and_alert_raised() {
    let mut nodes = Node::cluster(4, &Config::local());
    for node in &mut nodes {
        node.start();
    }
    let forker = &nodes[0];
    let honest = &nodes[1];
    let mut events = honest.subscribe();

    let d0 = unit_on(&forker.dag, &forker.keychain, &[], b"left");
    let d0_fork = unit_on(&forker.dag, &forker.keychain, &[], b"right");
    assert_ne!(d0.hash(), d0_fork.hash());

    honest.alert_dag.add_unit(d0.clone()).expect("first version accepted");
    let err = honest
        .alert_dag
        .add_unit(d0_fork.clone())
        .expect_err("second version needs a commitment");
    assert!(matches!(err, AlephError::MissingData(_)), "unexpected error: {err}");
    assert!(!honest.dag.contains(d0_fork.hash()));

    let detected = next_event(&mut events, |event| {
        matches!(event, ConsensusEvent::ForkDetected { .. })
    })
    .await;
    assert_eq!(detected, ConsensusEvent::ForkDetected { forker: 0 });
    let raised = next_event(&mut events, |event| {
        matches!(event, ConsensusEvent::AlertRaised { .. })
    })
    .await;
    assert_eq!(raised, ConsensusEvent::AlertRaised { forker: 0 });

    assert!(honest.alerter.is_forker(0));
    let commitment = honest
        .alerter
        .commitments()
        .get_by_parties(1, 0)
        .expect("own commitment stored");
    assert_eq!(commitment.hash(), Some(d0.hash()), "committed to the unit we hold");
    assert_eq!(commitment.rmc_id(), alert_id(0, 1, 4));

    // Peers that signed the alert know about the forker too.
    eventually("peers learn the forker", || {
        nodes[2].alerter.is_forker(0) && nodes[3].alerter.is_forker(0)
    })
    .await;

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_commitment_is_served_to_a_peer() {
    let mut nodes = Node::cluster(4, &Config::local());
    for node in &mut nodes {
        node.start();
    }
    let forker = &nodes[0];
    let d0 = unit_on(&forker.dag, &forker.keychain, &[], b"left");
    let d0_fork = unit_on(&forker.dag, &forker.keychain, &[], b"right");

    let raiser = &nodes[2];
    let mut events = raiser.subscribe();
    raiser.alert_dag.add_unit(d0_fork.clone()).expect("fork seen first");
    let _ = raiser.alert_dag.add_unit(d0.clone());
    next_event(&mut events, |event| {
        *event == ConsensusEvent::AlertRaised { forker: 0 }
    })
    .await;

    let asker = &nodes[3];
    asker
        .alerter
        .request_commitment(d0_fork.hash(), 2)
        .await
        .expect("commitment served");
    let commitment = asker
        .alerter
        .commitments()
        .get_by_hash(d0_fork.hash())
        .expect("commitment stored");
    assert_eq!(commitment.rmc_id(), 8);
    assert_eq!(commitment.rmc_id(), alert_id(0, 2, 4));
    let chain = commitment.chain();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].hash(), d0_fork.hash());

    asker
        .alert_dag
        .add_unit(d0_fork.clone())
        .expect("committed version accepted");
    assert!(asker.dag.contains(d0_fork.hash()));

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_unknown_unit_has_no_commitment() {
    let mut nodes = Node::cluster(4, &Config::local());
    for node in &mut nodes {
        node.start();
    }
    let stray = unit_on(&nodes[0].dag, &nodes[0].keychain, &[], b"");

    let err = nodes[3]
        .alerter
        .request_commitment(stray.hash(), 1)
        .await
        .expect_err("node 1 never saw the unit");
    assert!(matches!(err, AlephError::MissingData(_)), "unexpected error: {err}");

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finished_alert_reaches_a_peer_that_never_signed() {
    let mut nodes = Node::cluster(7, &Config::local());
    for node in nodes.iter_mut().take(6) {
        node.start();
    }
    let forker = &nodes[0];
    let d0 = unit_on(&forker.dag, &forker.keychain, &[], b"left");
    let d0_fork = unit_on(&forker.dag, &forker.keychain, &[], b"right");

    let raiser = &nodes[1];
    let mut events = raiser.subscribe();
    raiser.alert_dag.add_unit(d0).expect("first version accepted");
    let _ = raiser.alert_dag.add_unit(d0_fork);
    next_event(&mut events, |event| {
        *event == ConsensusEvent::AlertRaised { forker: 0 }
    })
    .await;

    // Process 6 was offline while the quorum formed.
    let id = alert_id(0, 1, 7);
    assert_ne!(nodes[6].alerter.rmc().status(id), RmcStatus::Finished);
    nodes[6].start();
    let late = &nodes[6];
    eventually("the late peer holds the proof", || {
        late.alerter.rmc().status(id) == RmcStatus::Finished
    })
    .await;
    assert!(late.alerter.is_forker(0));

    for node in nodes {
        node.stop().await;
    }
}
