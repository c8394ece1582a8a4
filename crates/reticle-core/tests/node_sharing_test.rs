//! Shared nodes: identical prefixes share beta nodes inside a partition,
//! object-side nodes are shared by every partition they feed

use reticle_core::network::NodeKind;
use reticle_core::{
    EngineConfig, Fact, FactValue, Network, NetworkBuilder, Operator, Pattern, RuleDefinition, Session,
};
use std::collections::BTreeSet;
use std::sync::Arc;

fn joined(name: &str, left_kind: &str) -> RuleDefinition {
    let key = name.to_string();
    RuleDefinition::new(name)
        .pattern(Pattern::new(left_kind).bind_field("id", "id"))
        .pattern(
            Pattern::new("B")
                .field("active", Operator::Equal, true)
                .join_on("owner", Operator::Equal, "id"),
        )
        .then(move |_, ctx| {
            ctx.globals().append("fired", key.as_str());
            Ok(())
        })
}

fn count(network: &Network, name: &str) -> usize {
    network.nodes().iter().filter(|n| n.kind.name() == name).count()
}

#[test]
fn test_identical_prefixes_share_one_join_and_both_rules_fire() {
    let network = Network::from_rules(
        &EngineConfig::with_partitions(4),
        vec![joined("first", "A"), joined("second", "A")],
    )
    .unwrap();
    assert_eq!(count(&network, "left_input_adapter"), 1);
    assert_eq!(count(&network, "join"), 1);
    assert_eq!(count(&network, "terminal"), 2);
    assert_eq!(network.rule("first").unwrap().partition, network.rule("second").unwrap().partition);
    assert!(!network.is_partitioned(), "rules sharing an adapter share a partition");

    let session = Session::new(Arc::new(network)).unwrap();
    session.insert(Fact::new("A").with_field("id", 1)).unwrap();
    session.insert(Fact::new("B").with_field("owner", 1).with_field("active", true)).unwrap();
    session.insert(Fact::new("B").with_field("owner", 1).with_field("active", false)).unwrap();
    assert_eq!(session.fire_all_rules().unwrap(), 2);
}

#[test]
fn test_object_side_nodes_feed_every_partition() {
    let network = Network::from_rules(
        &EngineConfig::with_partitions(2),
        vec![joined("from_a", "A"), joined("from_c", "C")],
    )
    .unwrap();
    assert!(network.is_partitioned());

    let alphas: Vec<_> =
        network.nodes().iter().filter(|n| matches!(n.kind, NodeKind::Alpha { .. })).collect();
    assert_eq!(alphas.len(), 1, "the B filter is shared");
    assert_eq!(alphas[0].reach, BTreeSet::from([0, 1]));
    assert!(alphas[0].partition.is_none());
    assert_eq!(network.partitions_for("B"), &[0, 1]);

    // the joins hang off different adapters, so nothing on the left side is shared
    let joins: Vec<_> = network.nodes().iter().filter(|n| n.kind.name() == "join").collect();
    assert_eq!(joins.len(), 2);
    let join_partitions: BTreeSet<_> = joins.iter().filter_map(|n| n.partition).collect();
    assert_eq!(join_partitions, BTreeSet::from([0, 1]));

    let session = Session::new(Arc::new(network)).unwrap();
    session.insert(Fact::new("A").with_field("id", 9)).unwrap();
    session.insert(Fact::new("C").with_field("id", 9)).unwrap();
    session.insert(Fact::new("B").with_field("owner", 9).with_field("active", true)).unwrap();
    assert_eq!(session.settle().unwrap(), 2, "one B insert activates a rule on each partition");

    let mut partitions: Vec<_> = session.activations().unwrap().into_iter().map(|a| a.partition).collect();
    partitions.sort_unstable();
    assert_eq!(partitions, vec![0, 1]);
    assert_eq!(session.fire_all_rules().unwrap(), 2);
}

#[test]
fn test_removed_rule_leaves_shared_nodes_to_the_survivor() {
    let config = EngineConfig::single_threaded();
    let mut builder = NetworkBuilder::new(&config);
    builder.add_rule(joined("keep", "A")).unwrap();
    builder.add_rule(joined("drop", "A")).unwrap();
    let before = builder.rule_count();
    builder.remove_rule("drop").unwrap();
    assert_eq!(builder.rule_count(), before - 1);

    let network = builder.build().unwrap();
    assert_eq!(count(&network, "join"), 1);
    assert_eq!(count(&network, "terminal"), 1);

    let session = Session::new(Arc::new(network)).unwrap();
    session.insert(Fact::new("A").with_field("id", 2)).unwrap();
    session.insert(Fact::new("B").with_field("owner", 2).with_field("active", true)).unwrap();
    assert_eq!(session.fire_all_rules().unwrap(), 1);
    assert_eq!(session.globals().get("fired"), Some(FactValue::List(vec!["keep".into()])));
}
