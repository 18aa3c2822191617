mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use aleph_dag_consensus::{
    crypto::{Hash, UNIT_SIGNATURE_LEN},
    error::AlephError,
    unit::Preunit,
    utils::unit_id,
};

use common::{beacon, grow_dag, keychains, new_dag, unit_on};

#[test]
fn test_dealing_units_start_every_chain() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));

    for keychain in &keys {
        let unit = dag
            .add_unit(unit_on(&dag, keychain, &[], b"dealing"))
            .expect("dealing unit accepted");
        assert_eq!(unit.height(), 0);
        assert_eq!(unit.level(), 0);
        assert!(unit.is_prime());
        assert!(unit.is_dealing());
    }

    assert_eq!(dag.prime_units(0).len(), 4);
    assert_eq!(dag.max_level(), Some(0));
}

#[test]
fn test_duplicate_insert_leaves_dag_unchanged() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    let preunit = unit_on(&dag, &keys[0], &[], b"once");
    dag.add_unit(preunit.clone()).expect("first insert");
    let len_before = dag.read().len();

    let err = dag.add_unit(preunit.clone()).expect_err("second insert refused");
    assert!(
        matches!(err, AlephError::DuplicateUnit(hash) if hash == *preunit.hash()),
        "unexpected error: {err}"
    );
    assert!(err.is_duplicate());
    assert_eq!(dag.read().len(), len_before, "duplicate must not be stored");
}

#[test]
fn test_unknown_parents_are_counted() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    let d0 = dag.add_unit(unit_on(&dag, &keys[0], &[], b"")).expect("d0");
    let phantom = Hash([7; 32]);

    let preunit = Preunit::signed(
        &keys[0],
        vec![*d0.hash(), phantom],
        Vec::new(),
        1u32.to_le_bytes().to_vec(),
    )
    .expect("signed");
    let err = dag.add_unit(preunit).expect_err("missing parent");
    assert!(
        matches!(err, AlephError::UnknownParents { missing_count: 1 }),
        "unexpected error: {err}"
    );
}

#[test]
fn test_bad_signature_and_unknown_creator_are_refused() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));

    let forged = Preunit::new(
        1,
        Vec::new(),
        Vec::new(),
        0u32.to_le_bytes().to_vec(),
        [1; UNIT_SIGNATURE_LEN],
    );
    let err = dag.add_unit(forged).expect_err("forged signature");
    assert!(matches!(err, AlephError::InvalidUnitSignature { creator: 1 }));

    let stranger = Preunit::new(
        9,
        Vec::new(),
        Vec::new(),
        Vec::new(),
        [0; UNIT_SIGNATURE_LEN],
    );
    let err = dag.add_unit(stranger).expect_err("creator outside the committee");
    assert!(matches!(err, AlephError::InvalidMember(9)));
    assert!(dag.read().is_empty());
}

#[test]
fn test_compliance_rules_reject_malformed_parents() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    let dealing: Vec<_> = keys
        .iter()
        .map(|keychain| {
            dag.add_unit(unit_on(&dag, keychain, &[], b""))
                .expect("dealing unit")
        })
        .collect();

    // First parent by someone else.
    let err = dag
        .add_unit(unit_on(&dag, &keys[0], &[&dealing[1], &dealing[2]], b""))
        .expect_err("foreign predecessor");
    assert!(matches!(err, AlephError::Compliance(_)), "unexpected error: {err}");

    // Only the predecessor.
    let err = dag
        .add_unit(unit_on(&dag, &keys[0], &[&dealing[0]], b""))
        .expect_err("single parent");
    assert!(matches!(err, AlephError::Compliance(_)), "unexpected error: {err}");

    // Two parents by one creator.
    let a1 = dag
        .add_unit(unit_on(&dag, &keys[1], &[&dealing[1], &dealing[0], &dealing[2]], b""))
        .expect("a1 accepted");
    let err = dag
        .add_unit(unit_on(&dag, &keys[0], &[&dealing[0], &dealing[1], &a1], b""))
        .expect_err("repeated creator");
    assert!(matches!(err, AlephError::Compliance(_)), "unexpected error: {err}");

    // Own unit as a non-first parent.
    let err = dag
        .add_unit(unit_on(&dag, &keys[2], &[&dealing[2], &dealing[1], &dealing[2]], b""))
        .expect_err("own unit repeated");
    assert!(matches!(err, AlephError::Compliance(_)), "unexpected error: {err}");
}

#[test]
fn test_parent_that_adds_no_primes_is_refused() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    let dealing: Vec<_> = keys
        .iter()
        .map(|keychain| {
            dag.add_unit(unit_on(&dag, keychain, &[], b""))
                .expect("dealing unit")
        })
        .collect();
    // Level 0 unit of creator 1 sitting on top of D0: it shows D0 and D1.
    let b1 = dag
        .add_unit(unit_on(&dag, &keys[1], &[&dealing[1], &dealing[0]], b""))
        .expect("b1 accepted");
    assert_eq!(b1.level(), 0);

    // After the predecessor D2 and b1, D0 shows nothing new at level 0.
    let err = dag
        .add_unit(unit_on(
            &dag,
            &keys[2],
            &[&dealing[2], &b1, &dealing[0]],
            b"",
        ))
        .expect_err("non-expanding parent");
    assert!(matches!(err, AlephError::Compliance(_)), "unexpected error: {err}");
}

#[test]
fn test_random_source_data_is_checked() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    let preunit = Preunit::signed(&keys[3], Vec::new(), Vec::new(), b"nonsense".to_vec())
        .expect("signed");

    let err = dag.add_unit(preunit).expect_err("rs_data must match the level");
    assert!(matches!(err, AlephError::Compliance(_)), "unexpected error: {err}");
}

#[test]
fn test_grown_dag_structure() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    let created = grow_dag(&dag, &keys, 5);
    let store = dag.read();

    assert_eq!(store.len(), created.len());
    assert!(store.max_level().is_some_and(|level| level >= 5));
    for level in 0..=5 {
        let creators: std::collections::HashSet<u16> = store
            .prime_units(level)
            .iter()
            .map(|unit| unit.creator())
            .collect();
        assert!(
            creators.len() >= store.quorum(),
            "level {level} has primes of {} creators",
            creators.len()
        );
    }

    for unit in store.units() {
        for parent in unit.parents() {
            assert!(store.below(*parent, unit.index()), "parent below its child");
            assert!(
                !store.below(unit.index(), *parent),
                "child must not be below its parent"
            );
        }
        if let Some(pred) = unit.predecessor() {
            let pred = store.unit(pred);
            assert_eq!(pred.creator(), unit.creator());
            assert_eq!(pred.height() + 1, unit.height());
            assert!(pred.level() <= unit.level());
            assert_eq!(unit.is_prime(), unit.level() > pred.level());
        }
        let by_id = store.get_by_id(unit_id(unit.creator(), unit.height(), 4));
        assert_eq!(by_id.len(), 1, "no forks in an honest DAG");
        assert_eq!(by_id[0].hash(), unit.hash());
    }
}

#[test]
fn test_units_above_height_follow_the_chain() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    grow_dag(&dag, &keys, 3);
    let store = dag.read();

    let all = store.units_above_height(2, None);
    let top = store.maximal_by(2)[0];
    assert_eq!(all.len() as u32, store.unit(top).height() + 1);
    for (height, unit) in all.iter().enumerate() {
        assert_eq!(unit.height(), height as u32);
        assert_eq!(unit.creator(), 2);
    }

    let above = store.units_above_height(2, Some(1));
    assert_eq!(above.len(), all.len() - 2);
    assert!(above.iter().all(|unit| unit.height() > 1));
    assert!(
        store
            .units_above_height(2, Some(store.unit(top).height()))
            .is_empty()
    );
}

#[test]
fn test_observers_see_every_insert() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    dag.after_insert(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let created = grow_dag(&dag, &keys, 2);
    assert_eq!(seen.load(Ordering::SeqCst), created.len());

    let _ = dag.add_unit(created[0].clone());
    assert_eq!(
        seen.load(Ordering::SeqCst),
        created.len(),
        "refused units are not reported"
    );
}

#[test]
fn test_antichain_reports_each_slot() {
    let keys = keychains(4);
    let dag = new_dag(&keys, beacon(4));
    let first = unit_on(&dag, &keys[0], &[], b"");
    dag.add_unit(first.clone()).expect("first");

    let results = dag.add_antichain(vec![
        first,
        unit_on(&dag, &keys[1], &[], b""),
        unit_on(&dag, &keys[2], &[], b""),
    ]);
    assert!(matches!(results[0], Err(AlephError::DuplicateUnit(_))));
    assert!(results[1].is_ok());
    assert!(results[2].is_ok());

    let collapsed = AlephError::aggregate(results);
    assert_eq!(collapsed.expect("duplicates are ignored").len(), 2);
}
