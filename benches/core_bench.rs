use criterion::{criterion_group, criterion_main, Criterion};
use layerstack::config::LayerAttributes;
use layerstack::layer::{LayerBuilder, LocalDir, PathContentMap};
use layerstack::logging::NoopObserver;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

fn bench_layers(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = dir.path();

    for i in 0..100 {
        fs::write(path.join(format!("file_{}.txt", i)), format!("content {}", i)).unwrap();
    }
    let builder = LayerBuilder::new(Arc::new(NoopObserver));
    let attributes = LayerAttributes::default();
    let local = LocalDir::new(path);

    c.bench_function("layer from directory", |b| b.iter(|| {
        let _ = builder.from_dir(&local, &attributes);
    }));

    let map: PathContentMap = (0..100)
        .map(|i| (format!("/app/file_{}.txt", i), vec![b'x'; 4096]))
        .collect();
    c.bench_function("layer from map", |b| b.iter(|| {
        let _ = builder.from_map(&map, &attributes);
    }));
}

criterion_group!(benches, bench_layers);
criterion_main!(benches);
