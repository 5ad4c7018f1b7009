use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lineprof::clock::{Clock, ManualClock};
use lineprof::config::Config;
use lineprof::source::{SourceCatalog, SourceProvider};
use lineprof::{ExecutorHooks, FunctionId, FunctionKey, NamespaceId, ProfilerRuntime};

const NS: NamespaceId = NamespaceId(1);

fn build_runtime() -> (Arc<ManualClock>, Arc<ProfilerRuntime>) {
    let clock = Arc::new(ManualClock::new());
    let catalog = Arc::new(SourceCatalog::new());
    for id in 1..=8u32 {
        catalog.register(
            FunctionKey {
                namespace: NS,
                function: FunctionId(id),
            },
            format!("fn_{id}"),
            "begin\nwork;\nmore;\nend",
        );
    }

    let runtime = ProfilerRuntime::with_clock(
        &Config::default(),
        catalog as Arc<dyn SourceProvider>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    (clock, runtime)
}

fn bench_statement_hooks(c: &mut Criterion) {
    let (clock, runtime) = build_runtime();
    let mut session = runtime.session(NS, 1);
    session.set_enabled_local(true);

    let mut invocation = session.on_function_enter(FunctionId(1)).expect("active");
    session.on_function_begin(&invocation);

    c.bench_function("statement_before_after", |b| {
        b.iter(|| {
            session.on_statement_before(black_box(&mut invocation), black_box(2));
            clock.advance(3);
            session.on_statement_after(black_box(&mut invocation), black_box(2));
        })
    });
}

fn bench_enter_exit_cycle(c: &mut Criterion) {
    let (clock, runtime) = build_runtime();
    let mut session = runtime.session(NS, 1);
    session.set_enabled_local(true);

    c.bench_function("function_enter_exit", |b| {
        b.iter(|| {
            let invocation = session
                .on_function_enter(black_box(FunctionId(2)))
                .expect("active");
            session.on_function_begin(&invocation);
            clock.advance(5);
            session.on_function_exit(invocation);
        })
    });
}

fn bench_collect_into_shared(c: &mut Criterion) {
    let (clock, runtime) = build_runtime();
    let mut session = runtime.session(NS, 1);
    session.set_enabled_local(true);

    c.bench_function("collect_into_shared", |b| {
        b.iter(|| {
            for id in 1..=8u32 {
                let mut invocation = session
                    .on_function_enter(FunctionId(id))
                    .expect("active");
                session.on_function_begin(&invocation);
                session.on_statement_before(&mut invocation, 2);
                clock.advance(2);
                session.on_statement_after(&mut invocation, 2);
                session.on_function_exit(invocation);
            }
            black_box(session.collect_into_shared().expect("merge"))
        })
    });
}

criterion_group!(
    benches,
    bench_statement_hooks,
    bench_enter_exit_cycle,
    bench_collect_into_shared
);
criterion_main!(benches);
