use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tidewatch::component::{ConnectionKind, Mailbox};
use tidewatch::message::Message;
use tidewatch::router::MessageRouter;
use tidewatch::step::Step;

struct Topology {
    router: MessageRouter,
    inputs: Vec<Arc<Mailbox>>,
    stations: Vec<Arc<Mailbox>>,
}

/// `n` inputs each feeding one tag, `n` stations each consuming two adjacent
/// tags and producing a result one shared output consumes.
fn topology(n: usize) -> Topology {
    let router = MessageRouter::new();
    let mut inputs = Vec::with_capacity(n);
    let mut stations = Vec::with_capacity(n);
    let output = Arc::new(Mailbox::new("out"));

    for i in 0..n {
        let input = Arc::new(Mailbox::new(format!("in_{i}")));
        input.add_produces([format!("T{i}")]);
        router.register(input.clone(), ConnectionKind::Input).unwrap();
        inputs.push(input);

        let station = Arc::new(Mailbox::new(format!("S{i}")));
        station.add_consumes([format!("T{i}"), format!("T{}", (i + 1) % n)]);
        router.register(station.clone(), ConnectionKind::Model).unwrap();
        stations.push(station);

        output.add_consumes([format!("S{i}")]);
    }
    router.register(output, ConnectionKind::Output).unwrap();
    router.rebuild_routes();
    Topology {
        router,
        inputs,
        stations,
    }
}

fn run_step(topo: &Topology, step: &Step) -> Duration {
    for (i, input) in topo.inputs.iter().enumerate() {
        input.send(Message::value(format!("T{i}"), step.clone(), i as f64));
    }
    let start = Instant::now();
    black_box(topo.router.run());
    let elapsed = start.elapsed();

    for station in &topo.stations {
        black_box(station.inbox().drain_until(step));
    }
    elapsed
}

pub fn bench_router_fixpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_fixpoint");
    let base = Step::integer(0, 1);

    for &nodes in &[8_usize, 64, 512] {
        let topo = topology(nodes);
        group.bench_function(BenchmarkId::from_parameter(nodes), |b| {
            b.iter_custom(|n| {
                let mut total = Duration::ZERO;
                for i in 0..n {
                    total += run_step(&topo, &base.at_index(i as i64));
                }
                total
            });
        });
    }

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(500))
        .measurement_time(Duration::from_secs(3))
        .sample_size(20);
    targets = bench_router_fixpoint
}
criterion_main!(benches);
