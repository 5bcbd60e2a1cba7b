//! Walker benchmarks
//!
//! Measures a full walk of synthetic user maildirs of increasing size, with
//! and without per-directory watch registration.
//!
//! - **walk_tree**: counting, sizing and checksumming only
//! - **walk_tree_register_all**: the same walk with every directory registered

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use maildir_exporter::config::WatchPolicy;
use maildir_exporter::walker::walk_tree;
use std::fs;
use std::hint::black_box;
use std::path::Path;
use tempfile::TempDir;

const FOLDERS: &[&str] = &["", ".Sent", ".Drafts", ".Trash", ".Archive"];

/// Build a maildir with `messages` files spread over the usual folders.
fn create_maildir(root: &Path, messages: usize) {
    for folder in FOLDERS {
        for sub in ["cur", "new", "tmp"] {
            fs::create_dir_all(root.join(folder).join(sub)).unwrap();
        }
    }
    for i in 0..messages {
        let folder = FOLDERS[i % FOLDERS.len()];
        let name = format!("{}.M{}P1.host:2,S", 1_700_000_000 + i, i);
        fs::write(root.join(folder).join("cur").join(name), vec![b'm'; 512]).unwrap();
    }
}

fn bench_walk_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("walk_tree");

    for size in [100, 1000, 10000].iter() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("alice");
        create_maildir(&root, *size);
        let policy = WatchPolicy::default();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(walk_tree(&root, &policy, |_| Ok(())).unwrap()));
        });
    }

    group.finish();
}

fn bench_walk_tree_register_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("walk_tree_register_all");

    for size in [100, 1000].iter() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("alice");
        create_maildir(&root, *size);
        let policy = WatchPolicy::AllDirectories;

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut registered = Vec::new();
                let result = walk_tree(&root, &policy, |dir| {
                    registered.push(dir.to_path_buf());
                    Ok(())
                })
                .unwrap();
                black_box((result, registered))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_walk_tree, bench_walk_tree_register_all);
criterion_main!(benches);
