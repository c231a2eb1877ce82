use std::collections::HashMap;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use scriptorium_core::{Commit, CommitGraph, CommitHash, PeerId, Record};

/// Linear history of `len` commits, returned with its tip.
fn chain(len: usize) -> (HashMap<CommitHash, Commit>, CommitHash) {
    let author = PeerId([1; 32]);
    let mut commits = HashMap::new();
    let root = Commit::root(vec![0; 64], author, None);
    let mut tip = root.hash().unwrap();
    commits.insert(tip, root);
    for i in 1..len {
        let commit = Commit {
            state: vec![(i % 251) as u8; 64],
            previous_commit_hashes: vec![tip],
            authors: vec![author],
            witnesses: vec![],
            meta: None,
        };
        tip = commit.hash().unwrap();
        commits.insert(tip, commit);
    }
    (commits, tip)
}

fn bench_commit_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("Commit");
    let commit = Commit {
        state: vec![7u8; 4096],
        previous_commit_hashes: vec![CommitHash::of(b"parent")],
        authors: vec![PeerId([1; 32]), PeerId([2; 32])],
        witnesses: vec![PeerId([2; 32])],
        meta: None,
    };
    group.throughput(Throughput::Bytes(4096));
    group.bench_function("hash_4KB", |b| {
        b.iter(|| black_box(black_box(&commit).hash().unwrap()));
    });

    let record = Record::commit(&commit).unwrap();
    group.bench_function("verify_and_decode_4KB", |b| {
        b.iter(|| {
            record.verify().unwrap();
            black_box(record.decode_commit().unwrap());
        });
    });
    group.finish();
}

fn bench_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("CommitGraph");
    let (commits, tip) = chain(1_000);
    let graph = CommitGraph::new(&commits);
    let root = graph.roots()[0];

    group.throughput(Throughput::Elements(1_000));
    group.bench_function("ancestors_1k_chain", |b| {
        b.iter(|| black_box(graph.ancestors(black_box(&tip))));
    });
    group.bench_function("is_ancestor_root_1k_chain", |b| {
        b.iter(|| black_box(graph.is_ancestor(&root, &tip)));
    });
    group.bench_function("check_acyclic_1k_chain", |b| {
        b.iter(|| black_box(graph.check_acyclic()));
    });
    group.finish();
}

criterion_group!(benches, bench_commit_hash, bench_graph);
criterion_main!(benches);
