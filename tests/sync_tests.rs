mod common;

use aleph_dag_consensus::{
    config::Config, crypto::Keychain, gossip::DagInfo, unit::Preunit, utils::unit_id,
};

use common::{Node, WAIT, beacon, eventually, grow_dag, new_dag, unit_on, within};

/// Grow a DAG with the cluster's keys and load it into `node`.
fn preload(node: &Node, keys: &[Keychain], level: u32) -> Vec<Preunit> {
    let shared = new_dag(keys, beacon(keys.len() as u16));
    let created = grow_dag(&shared, keys, level);
    for preunit in &created {
        node.alert_dag
            .add_unit(preunit.clone())
            .expect("preloaded unit accepted");
    }
    created
}

fn keys_of(nodes: &[Node]) -> Vec<Keychain> {
    nodes.iter().map(|node| node.keychain.clone()).collect()
}

#[tokio::test]
async fn test_gossip_exchanges_dealing_units_both_ways() {
    let mut nodes = Node::cluster(4, &Config::local());
    for node in &mut nodes {
        node.start();
    }
    let d0 = nodes[0].create();
    let d1 = nodes[1].create();
    assert!(!nodes[0].dag.contains(d1.hash()));

    nodes[0].syncer.gossip(1).await.expect("gossip succeeds");

    eventually("both nodes hold both dealing units", || {
        [&nodes[0], &nodes[1]]
            .iter()
            .all(|node| node.dag.contains(d0.hash()) && node.dag.contains(d1.hash()))
    })
    .await;
    assert!(!nodes[2].dag.contains(d0.hash()), "bystanders are not involved");

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_gossip_catches_up_a_whole_dag() {
    let mut nodes = Node::cluster(4, &Config::local());
    for node in &mut nodes {
        node.start();
    }
    let keys = keys_of(&nodes);
    let created = preload(&nodes[0], &keys, 4);

    nodes[2].syncer.gossip(0).await.expect("gossip succeeds");

    eventually("node 2 holds the whole DAG", || {
        nodes[2].dag.read().len() == created.len()
    })
    .await;
    assert_eq!(nodes[2].adder.waiting_count(), 0);
    assert_eq!(nodes[2].dag.max_level(), nodes[0].dag.max_level());

    for node in nodes {
        node.stop().await;
    }
}

#[test]
fn test_dag_summaries_tell_what_is_missing() {
    let keys = common::keychains(4);
    let full = new_dag(&keys, beacon(4));
    let created = grow_dag(&full, &keys, 2);
    let empty = new_dag(&keys, beacon(4));

    let empty_info = DagInfo::of(&empty.read());
    let missing = empty_info.missing_in(&full.read());
    assert_eq!(missing.len(), created.len());
    let levels: Vec<u32> = missing
        .iter()
        .map(|preunit| full.get(preunit.hash()).expect("known").level())
        .collect();
    assert!(levels.windows(2).all(|pair| pair[0] <= pair[1]), "parents come first");

    let full_info = DagInfo::of(&full.read());
    assert!(full_info.missing_in(&full.read()).is_empty());
    assert!(full_info.unknown_fork_tips(&empty).is_empty());

    let encoded = prost::Message::encode_to_vec(&full_info);
    let decoded: DagInfo = prost::Message::decode(encoded.as_slice()).expect("decodes");
    assert_eq!(decoded, full_info);
}

#[tokio::test]
async fn test_fetch_returns_units_by_id() {
    let mut nodes = Node::cluster(4, &Config::local());
    for node in &mut nodes {
        node.start();
    }
    let keys = keys_of(&nodes);
    preload(&nodes[0], &keys, 2);

    let wanted = [unit_id(1, 0, 4), unit_id(2, 1, 4), unit_id(3, 999, 4)];
    let fetched = nodes[3]
        .syncer
        .fetch(0, &wanted)
        .await
        .expect("fetch succeeds");
    assert_eq!(fetched.len(), 2, "unknown ids are skipped");
    assert_eq!(fetched[0].creator(), 1);
    assert!(fetched[0].is_dealing());
    assert_eq!(fetched[1].creator(), 2);
    assert_eq!(
        nodes[0]
            .dag
            .get(fetched[1].hash())
            .expect("served from node 0")
            .height(),
        1
    );

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_multicast_reaches_every_peer() {
    let mut nodes = Node::cluster(4, &Config::local());
    for node in &mut nodes {
        node.start();
    }
    let unit = nodes[1].create();
    nodes[1].syncer.multicast(unit.preunit());

    eventually("every peer holds the multicast unit", || {
        nodes.iter().all(|node| node.dag.contains(unit.hash()))
    })
    .await;

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_missing_parents_are_recovered() {
    let mut nodes = Node::cluster(4, &Config::local());
    for node in &mut nodes {
        node.start();
    }
    nodes[3].start_outbound();
    let keys = keys_of(&nodes);
    let created = preload(&nodes[0], &keys, 3);
    let top = created.last().expect("units were created").clone();

    let results = within(WAIT, nodes[3].adder.add_preunits(0, vec![top.clone()])).await;
    assert!(results[0].is_ok(), "queued: {:?}", results[0]);

    let ancestors = {
        let store = nodes[0].dag.read();
        let top = store.index_of(top.hash()).expect("top unit");
        store
            .units()
            .filter(|unit| store.below(unit.index(), top))
            .count()
    };
    let node = &nodes[3];
    eventually("node 3 recovers every ancestor", || {
        node.dag.contains(top.hash()) && node.dag.read().len() >= ancestors
    })
    .await;
    assert_eq!(nodes[3].adder.waiting_count(), 0);

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_children_of_a_refused_parent_are_dropped() {
    let mut nodes = Node::cluster(4, &Config::local());
    for node in &mut nodes {
        node.start();
    }
    let keys = keys_of(&nodes);
    let receiver = &nodes[3];
    let dealing: Vec<_> = keys
        .iter()
        .map(|keychain| {
            receiver
                .alert_dag
                .add_unit(unit_on(&receiver.dag, keychain, &[], b""))
                .expect("dealing unit")
        })
        .collect();

    // Only the predecessor as parent: well signed, never compliant.
    let refused = unit_on(&receiver.dag, &keys[1], &[&dealing[1]], b"");
    let child = Preunit::signed(
        &keys[2],
        vec![*dealing[2].hash(), *refused.hash(), *dealing[0].hash()],
        Vec::new(),
        Vec::new(),
    )
    .expect("signed child");

    let results = receiver.adder.add_preunits(0, vec![child.clone()]).await;
    assert!(results[0].is_ok(), "queued: {:?}", results[0]);
    eventually("the child waits for its parent", || {
        receiver.adder.waiting_count() == 1
    })
    .await;

    let results = receiver.adder.add_preunits(0, vec![refused.clone()]).await;
    assert!(results[0].is_ok(), "queued: {:?}", results[0]);
    eventually("the waiting room is emptied", || {
        receiver.adder.waiting_count() == 0
    })
    .await;
    assert!(!receiver.dag.contains(refused.hash()));
    assert!(!receiver.dag.contains(child.hash()));

    let results = receiver.adder.add_preunits(0, vec![child.clone()]).await;
    assert!(results[0].is_ok(), "a dropped child may arrive again");

    for node in nodes {
        node.stop().await;
    }
}
