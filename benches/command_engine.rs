use criterion::{black_box, criterion_group, criterion_main, Criterion};
use redoubt::{Command, CommandCache, CommandEngine};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct BenchError;

impl std::fmt::Display for BenchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BenchError")
    }
}

impl std::error::Error for BenchError {}

fn echo_command(name: &str) -> Command<u64, BenchError> {
    Command::builder()
        .name(name)
        .uri("http://bench.example.com")
        .max_attempts(1)
        .callback(|_ctx, _base| async { Ok(black_box(42u64)) })
        .build()
        .expect("valid descriptor")
}

fn engine_happy_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = CommandEngine::new();
    let command = echo_command("HappyPath");

    c.bench_function("engine_execute_success", |b| {
        b.to_async(&rt).iter(|| {
            let engine = engine.clone();
            let command = command.clone();
            async move { engine.execute(&command).await.unwrap() }
        })
    });
}

fn engine_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = CommandEngine::new();
    let cache = Arc::new(CommandCache::<u64>::in_memory("bench"));
    let command = Command::builder()
        .name("CacheHit")
        .uri("http://bench.example.com")
        .cache(cache, "warm")
        .max_attempts(1)
        .callback(|_ctx, _base| async { Ok(black_box(42u64)) })
        .build()
        .expect("valid descriptor");

    // Warm the entry so every iteration is a pure hit.
    rt.block_on(async { engine.execute(&command).await.unwrap() });

    c.bench_function("engine_execute_cache_hit", |b| {
        b.to_async(&rt).iter(|| {
            let engine = engine.clone();
            let command = command.clone();
            async move { engine.execute(&command).await.unwrap() }
        })
    });
}

fn breaker_allow_overhead(c: &mut Criterion) {
    use redoubt::{BreakerPolicy, CircuitBreaker};

    let breaker = CircuitBreaker::new("bench", BreakerPolicy::default());
    c.bench_function("breaker_allow_closed", |b| {
        b.iter(|| {
            let _ = black_box(breaker.allow());
            breaker.record_success();
        })
    });
}

criterion_group!(benches, engine_happy_path, engine_cache_hit, breaker_allow_overhead);
criterion_main!(benches);
