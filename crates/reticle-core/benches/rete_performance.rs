use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use reticle_core::{EngineConfig, Fact, Network, Operator, Pattern, RuleDefinition, Session};
use std::sync::Arc;

fn create_employee(id: i64) -> Fact {
    Fact::new("Employee")
        .with_field("employee_id", id)
        .with_field("hours_worked", 30.0 + (id % 20) as f64)
        .with_field("department", if id % 3 == 0 { "engineering" } else { "sales" })
}

fn overtime_rule(id: usize) -> RuleDefinition {
    RuleDefinition::new(format!("overtime_{id}"))
        .pattern(
            Pattern::new("Employee")
                .bind("e")
                .field("hours_worked", Operator::GreaterThan, 35.0)
                .field("employee_id", Operator::GreaterThanOrEqual, id as i64),
        )
        .then(|_, _| Ok(()))
}

fn department_join_rule() -> RuleDefinition {
    RuleDefinition::new("department_budget")
        .pattern(Pattern::new("Department").bind_field("name", "name"))
        .pattern(Pattern::new("Employee").join_on("department", Operator::Equal, "name"))
        .then(|_, _| Ok(()))
}

fn session(config: &EngineConfig, rules: Vec<RuleDefinition>) -> Session {
    Session::new(Arc::new(Network::from_rules(config, rules).unwrap())).unwrap()
}

fn bench_single_fact(c: &mut Criterion) {
    let session = session(&EngineConfig::single_threaded(), vec![overtime_rule(0)]);

    c.bench_function("insert_and_fire_single_fact", |b| {
        b.iter(|| {
            let id = session.insert(create_employee(black_box(7))).unwrap();
            black_box(session.fire_all_rules().unwrap());
            session.retract(id).unwrap();
        });
    });
}

fn bench_bulk_insert(c: &mut Criterion) {
    let rules: Vec<_> = (0..10).map(overtime_rule).collect();

    c.bench_function("insert_and_fire_1000_facts", |b| {
        b.iter(|| {
            let session = session(&EngineConfig::single_threaded(), rules.clone());
            for id in 0..1000 {
                session.insert(create_employee(id)).unwrap();
            }
            black_box(session.fire_all_rules().unwrap());
        });
    });
}

fn bench_indexed_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexed_join");
    for employees in [100_i64, 1_000, 5_000] {
        group.bench_with_input(BenchmarkId::from_parameter(employees), &employees, |b, &employees| {
            b.iter(|| {
                let session = session(&EngineConfig::single_threaded(), vec![department_join_rule()]);
                for name in ["engineering", "sales"] {
                    session.insert(Fact::new("Department").with_field("name", name)).unwrap();
                }
                for id in 0..employees {
                    session.insert(create_employee(id)).unwrap();
                }
                black_box(session.settle().unwrap());
            });
        });
    }
    group.finish();
}

fn bench_partitioned_fire(c: &mut Criterion) {
    let rules = || {
        (0..32).map(|i| {
            RuleDefinition::new(format!("kind_{i}"))
                .pattern(Pattern::new(format!("K{i}")).bind("k"))
                .then(|_, _| Ok(()))
        })
    };

    let mut group = c.benchmark_group("partitioned_fire");
    for partitions in [1_usize, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(partitions), &partitions, |b, &partitions| {
            b.iter(|| {
                let session = session(&EngineConfig::with_partitions(partitions), rules().collect());
                for i in 0..4_000 {
                    session.insert(Fact::new(format!("K{}", i % 32))).unwrap();
                }
                black_box(session.fire_all_rules().unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_fact, bench_bulk_insert, bench_indexed_join, bench_partitioned_fire);
criterion_main!(benches);
