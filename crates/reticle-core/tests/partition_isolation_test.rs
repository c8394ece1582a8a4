//! Rules on different partitions evaluate independently and concurrently

use reticle_core::{EngineConfig, Fact, FactValue, Network, NetworkBuilder, Pattern, RuleDefinition, Session};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

fn tally(name: &str, kind: &str) -> RuleDefinition {
    let key = name.to_string();
    RuleDefinition::new(name).pattern(Pattern::new(kind).bind("f")).then(move |_, ctx| {
        ctx.globals().append(key.clone(), i64::try_from(ctx.partition())?);
        Ok(())
    })
}

fn two_partition_session() -> Arc<Session> {
    let config = EngineConfig::with_partitions(2);
    let network =
        Network::from_rules(&config, vec![tally("left", "Left"), tally("right", "Right")]).unwrap();
    Arc::new(Session::new(Arc::new(network)).unwrap())
}

fn list_len(session: &Session, name: &str) -> usize {
    match session.globals().get(name) {
        Some(FactValue::List(items)) => items.len(),
        _ => 0,
    }
}

#[test]
fn test_independent_rules_land_on_separate_partitions() {
    let session = two_partition_session();
    assert!(session.is_partitioned());
    assert_eq!(session.used_partitions(), 2);

    let network = session.network();
    let left = network.rule("left").unwrap().partition;
    let right = network.rule("right").unwrap().partition;
    assert_ne!(left, right);
    assert_eq!(network.partitions_for("Left"), &[left]);
    assert_eq!(network.partitions_for("Right"), &[right]);

    session.insert(Fact::new("Left")).unwrap();
    session.insert(Fact::new("Right")).unwrap();
    assert_eq!(session.fire_all_rules().unwrap(), 2);

    let partition_of = |name: &str| match session.globals().get(name) {
        Some(FactValue::List(items)) => items[0].clone(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(partition_of("left"), FactValue::Integer(left as i64));
    assert_eq!(partition_of("right"), FactValue::Integer(right as i64));
}

#[test]
fn test_interleaved_inserts_and_fires_lose_nothing() {
    const PER_WRITER: usize = 500;
    let session = two_partition_session();
    let writing = Arc::new(AtomicBool::new(true));

    let firer = {
        let session = Arc::clone(&session);
        let writing = Arc::clone(&writing);
        thread::spawn(move || {
            let mut fired = 0;
            while writing.load(Ordering::SeqCst) {
                fired += session.fire_all_rules().unwrap();
            }
            fired + session.fire_all_rules().unwrap()
        })
    };

    let writers: Vec<_> = ["Left", "Right", "Left", "Right"]
        .into_iter()
        .map(|kind| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let i = i64::try_from(i).unwrap();
                    session.insert(Fact::new(kind).with_field("i", i)).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    writing.store(false, Ordering::SeqCst);
    let fired = firer.join().unwrap();

    assert_eq!(fired, 4 * PER_WRITER);
    assert_eq!(list_len(&session, "left"), 2 * PER_WRITER);
    assert_eq!(list_len(&session, "right"), 2 * PER_WRITER);
    assert_eq!(session.settle().unwrap(), 0);
}

#[test]
fn test_retracts_during_concurrent_firing_stay_consistent() {
    let session = two_partition_session();
    let ids: Vec<_> = (0..200)
        .map(|i| {
            let kind = if i % 2 == 0 { "Left" } else { "Right" };
            session.insert(Fact::new(kind)).unwrap()
        })
        .collect();

    let retractor = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            for id in ids.iter().step_by(3) {
                session.retract(*id).unwrap();
            }
        })
    };
    let mut fired = session.fire_all_rules().unwrap();
    retractor.join().unwrap();
    fired += session.fire_all_rules().unwrap();

    assert!(fired <= 200);
    assert_eq!(fired, list_len(&session, "left") + list_len(&session, "right"));
    assert_eq!(session.settle().unwrap(), 0);
    assert_eq!(session.fact_count(), 200 - 67);
}

#[test]
fn test_assigned_slots_decide_partitioning() {
    let config = EngineConfig::with_partitions(4);
    let mut builder = NetworkBuilder::new(&config);
    builder.add_rule(tally("left", "Left")).unwrap();
    builder.add_rule(tally("right", "Right")).unwrap();
    builder.assign_partition("left", 3).unwrap();
    builder.assign_partition("right", 3).unwrap();
    let network = builder.build().unwrap();
    assert!(!network.is_partitioned(), "one used slot falls back to a single agenda");
    assert_eq!(network.used_partitions(), 1);

    let session = Session::new(Arc::new(network)).unwrap();
    session.insert(Fact::new("Left")).unwrap();
    session.insert(Fact::new("Right")).unwrap();
    assert_eq!(session.fire_all_rules().unwrap(), 2);
    assert!(!session.is_partitioned());
}
