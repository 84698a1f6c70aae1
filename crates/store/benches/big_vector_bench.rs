use config::StoreConfig;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use store::{BlockId, Handle};
use tempfile::tempdir;
use value::Value;

const N_OPS: usize = 10_000;
const CHUNK: usize = 512;

fn op(i: usize) -> Value {
    Value::map([
        ("index", Value::from(i as i64)),
        ("process", Value::from((i % 10) as i64)),
        ("type", Value::from("ok")),
        ("f", Value::from("txn")),
        ("value", Value::seq([Value::from("append"), Value::from(i as i64)])),
    ])
}

fn config() -> StoreConfig {
    StoreConfig::default()
        .with_chunk_size(CHUNK)
        .with_fsync(false)
}

fn write_history(h: &Handle) -> BlockId {
    let mut w = h.vector_writer(None, CHUNK).unwrap();
    for i in 0..N_OPS {
        w.append(op(i)).unwrap();
    }
    w.close().unwrap()
}

fn big_vector_write_benchmark(c: &mut Criterion) {
    c.bench_function("big_vector_write_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let h = Handle::create(dir.path().join("bench.jepsen"), config()).unwrap();
                (dir, h)
            },
            |(_dir, h)| {
                write_history(&h);
            },
            BatchSize::SmallInput,
        );
    });
}

fn big_vector_iter_benchmark(c: &mut Criterion) {
    c.bench_function("big_vector_iter_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("bench.jepsen");
                let h = Handle::create(&path, config()).unwrap();
                let id = write_history(&h);
                h.commit_root(id).unwrap();
                h.close().unwrap();
                let r = Handle::open_read_with(&path, config()).unwrap();
                let bv = r.read_big_vector(id).unwrap();
                (dir, bv)
            },
            |(_dir, bv)| {
                let n = bv.iter().filter(|v| v.is_ok()).count();
                assert_eq!(n, N_OPS);
            },
            BatchSize::LargeInput,
        );
    });
}

fn big_vector_par_fold_benchmark(c: &mut Criterion) {
    c.bench_function("big_vector_par_fold_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("bench.jepsen");
                let h = Handle::create(&path, config()).unwrap();
                let id = write_history(&h);
                h.commit_root(id).unwrap();
                h.close().unwrap();
                let r = Handle::open_read_with(&path, config()).unwrap();
                let bv = r.read_big_vector(id).unwrap();
                (dir, bv)
            },
            |(_dir, bv)| {
                let n = bv
                    .par_fold(|| 0usize, |acc, _| acc + 1, |a, b| a + b)
                    .unwrap();
                assert_eq!(n, N_OPS);
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    big_vector_write_benchmark,
    big_vector_iter_benchmark,
    big_vector_par_fold_benchmark
);
criterion_main!(benches);
