use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use phasegate::core::plan::{PhaseDecl, Plan, Workflow};
use phasegate::core::resolver::resolve;
use phasegate::core::taskcard::{CardStore, TaskCard};
use std::collections::BTreeSet;

/// `phases` phases of `width` workflows, each workflow a chain of `depth`
/// cards, every workflow depending on the previous one in its phase.
fn layered_plan(phases: usize, width: usize, depth: usize) -> (Plan, CardStore) {
    let mut plan = Plan::default();
    let mut cards = Vec::new();
    for p in 0..phases {
        let phase = format!("P{p}");
        plan.phases.push(PhaseDecl {
            id: phase.clone(),
            description: String::new(),
        });
        for w in 0..width {
            let wf = format!("W{p}-{w}");
            let mut depends_on = BTreeSet::new();
            if w > 0 {
                depends_on.insert(format!("W{p}-{}", w - 1));
            }
            let ids: Vec<String> = (0..depth).map(|c| format!("C{p}-{w}-{c}")).collect();
            for (c, id) in ids.iter().enumerate() {
                let mut card = TaskCard::new(id, "bench", "true");
                if c > 0 {
                    card = card.depends_on(&ids[c - 1]);
                }
                cards.push(card);
            }
            plan.workflows.push(Workflow {
                id: wf,
                phase: phase.clone(),
                depends_on,
                cards: ids.into_iter().rev().collect(),
                checks: Vec::new(),
            });
        }
    }
    (plan, CardStore::from_cards(cards))
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolver_order");
    for (phases, width, depth) in [(2, 4, 5), (4, 8, 10), (6, 16, 20)] {
        let (plan, cards) = layered_plan(phases, width, depth);
        let label = format!("{phases}x{width}x{depth}");
        group.bench_with_input(BenchmarkId::from_parameter(label), &(plan, cards), |b, (plan, cards)| {
            b.iter(|| {
                let order = resolve(black_box(plan), black_box(cards)).expect("resolves");
                black_box(order.card_order().len())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_resolve);
criterion_main!(benches);
