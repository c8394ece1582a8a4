//! Link/unlink soundness: a rule's path is linked exactly when every input on
//! it holds data, no activation survives on an unlinked path, and work staged
//! while a path was unlinked is not lost once it links.

use proptest::prelude::*;
use reticle_core::{EngineConfig, Fact, FactId, Network, Pattern, RuleDefinition, Session};
use std::collections::BTreeMap;
use std::sync::Arc;

const KINDS: [&str; 3] = ["A", "B", "C"];

#[derive(Debug, Clone)]
enum Op {
    Insert(usize),
    Retract(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..3).prop_map(Op::Insert),
        2 => any::<usize>().prop_map(Op::Retract),
    ]
}

/// `ab` ends after the first join; `abc` shares that prefix and adds a join on C
fn network() -> Network {
    let ab = RuleDefinition::new("ab")
        .pattern(Pattern::new("A").bind("a"))
        .pattern(Pattern::new("B").bind("b"))
        .then(|_, _| Ok(()));
    let abc = RuleDefinition::new("abc")
        .pattern(Pattern::new("A").bind("a"))
        .pattern(Pattern::new("B").bind("b"))
        .pattern(Pattern::new("C").bind("c"))
        .then(|_, _| Ok(()));
    Network::from_rules(&EngineConfig::single_threaded(), vec![ab, abc]).unwrap()
}

fn counts(model: &BTreeMap<FactId, usize>) -> [usize; 3] {
    let mut counts = [0; 3];
    for kind in model.values() {
        counts[*kind] += 1;
    }
    counts
}

fn rule_activations(session: &Session, rule: &str) -> usize {
    session.activations().unwrap().iter().filter(|a| a.rule == rule).count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn path_linked_iff_every_input_is_non_empty(ops in prop::collection::vec(op(), 1..30)) {
        let session = Session::new(Arc::new(network())).unwrap();
        let mut model: BTreeMap<FactId, usize> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Insert(kind) => {
                    let id = session.insert(Fact::new(KINDS[*kind])).unwrap();
                    model.insert(id, *kind);
                }
                Op::Retract(index) => {
                    if model.is_empty() {
                        continue;
                    }
                    let id = *model.keys().nth(index % model.len()).unwrap();
                    session.retract(id).unwrap();
                    model.remove(&id);
                }
            }
            session.settle().unwrap();

            let [a, b, c] = counts(&model);
            prop_assert_eq!(session.is_rule_linked("ab").unwrap(), a > 0 && b > 0);
            prop_assert_eq!(session.is_rule_linked("abc").unwrap(), a > 0 && b > 0 && c > 0);
            prop_assert_eq!(rule_activations(&session, "ab"), a * b);
            prop_assert_eq!(rule_activations(&session, "abc"), a * b * c);
        }

        // nothing staged while unlinked may fire, and nothing linked may be lost
        let [a, b, c] = counts(&model);
        prop_assert_eq!(session.fire_all_rules().unwrap(), a * b + a * b * c);
    }
}

#[test]
fn test_deferred_inserts_flush_when_the_last_input_fills() {
    let abc = RuleDefinition::new("abc")
        .pattern(Pattern::new("A").bind("a"))
        .pattern(Pattern::new("B").bind("b"))
        .pattern(Pattern::new("C").bind("c"))
        .then(|_, _| Ok(()));
    let network = Network::from_rules(&EngineConfig::single_threaded(), vec![abc]).unwrap();
    let session = Session::new(Arc::new(network)).unwrap();

    for _ in 0..2 {
        session.insert(Fact::new("A")).unwrap();
        session.insert(Fact::new("B")).unwrap();
    }
    assert_eq!(session.settle().unwrap(), 0);
    assert!(!session.is_rule_linked("abc").unwrap());
    assert_eq!(
        session.stats().unwrap().partitions[0].tuples,
        2,
        "only the root tuples of A exist while the joins are unlinked"
    );

    let c = session.insert(Fact::new("C")).unwrap();
    assert_eq!(session.settle().unwrap(), 4);
    assert!(session.is_rule_linked("abc").unwrap());

    session.retract(c).unwrap();
    assert_eq!(session.settle().unwrap(), 0);
    assert!(!session.is_rule_linked("abc").unwrap());
}

#[test]
fn test_unlinked_rule_keeps_shared_prefix_evaluated() {
    let session = Session::new(Arc::new(network())).unwrap();
    session.insert(Fact::new("A")).unwrap();
    session.insert(Fact::new("B")).unwrap();
    assert_eq!(session.settle().unwrap(), 1);
    assert!(session.is_rule_linked("ab").unwrap());
    assert!(!session.is_rule_linked("abc").unwrap());

    session.insert(Fact::new("C")).unwrap();
    assert_eq!(session.settle().unwrap(), 2);
    assert_eq!(session.fire_all_rules().unwrap(), 2);
}
