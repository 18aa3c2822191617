mod common;

use aleph_dag_consensus::{creator::new_unit, error::AlephError};

use common::{beacon, grow_dag, keychains, new_dag, unit_on};

#[test]
fn test_first_unit_is_dealing_and_second_waits_for_peers() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));

    let dealing = new_unit(&dag, &keys[0], 10, b"payload".to_vec()).expect("dealing unit");
    assert!(dealing.is_dealing());
    assert_eq!(dealing.data(), b"payload");
    dag.add_unit(dealing).expect("dealing unit accepted");

    let err = new_unit(&dag, &keys[0], 10, Vec::new()).expect_err("nothing to build on");
    assert!(matches!(err, AlephError::NoAvailableParents));

    dag.add_unit(unit_on(&dag, &keys[1], &[], b"")).expect("d1");
    let next = new_unit(&dag, &keys[0], 10, Vec::new()).expect("unit on d0 and d1");
    assert_eq!(next.parents().len(), 2);
    let unit = dag.add_unit(next).expect("accepted");
    assert_eq!(unit.height(), 1);
    assert_eq!(unit.level(), 0, "two creators are not a quorum");
}

#[test]
fn test_parents_respect_the_limit() {
    let keys = keychains(7);
    let dag = new_dag(&keys, beacon(7));
    for keychain in &keys {
        dag.add_unit(unit_on(&dag, keychain, &[], b"")).expect("dealing unit");
    }

    let preunit = new_unit(&dag, &keys[3], 3, Vec::new()).expect("unit");
    assert_eq!(preunit.parents().len(), 3);
    let unit = dag.add_unit(preunit).expect("accepted");
    assert_eq!(unit.level(), 0, "three of seven do not make a quorum");

    let wide = new_unit(&dag, &keys[4], 10, Vec::new()).expect("unit");
    assert_eq!(wide.parents().len(), 7);
    let wide = dag.add_unit(wide).expect("accepted");
    assert_eq!(wide.level(), 1);
    assert!(wide.is_prime());
}

#[test]
fn test_created_units_keep_climbing() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    grow_dag(&dag, &keys, 6);
    let store = dag.read();

    for unit in store.units() {
        let Some(pred) = unit.predecessor() else {
            continue;
        };
        let pred = store.unit(pred);
        assert!(unit.level() >= pred.level(), "levels never drop along a chain");
        let creators: std::collections::HashSet<u16> = unit
            .parents()
            .iter()
            .map(|parent| store.unit(*parent).creator())
            .collect();
        assert!(creators.len() >= 2);
        assert_eq!(creators.len(), unit.parents().len(), "one parent per creator");
    }
    assert!(store.max_level().is_some_and(|level| level >= 6));
}

#[test]
fn test_forked_creator_refuses_to_extend() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    dag.add_unit(unit_on(&dag, &keys[0], &[], b"left")).expect("left");
    dag.add_unit(unit_on(&dag, &keys[0], &[], b"right"))
        .expect("plain DAG keeps both branches");

    let err = new_unit(&dag, &keys[0], 10, Vec::new()).expect_err("two maximal units");
    assert!(matches!(err, AlephError::Compliance(_)), "unexpected error: {err}");
}
