//! Namespace path resolution benchmarking: trie walk versus LRU cache hit.

use std::fmt;

use netfs::namespace::{PathTrie, ResolveCache};

use rand::Rng;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

static DEPTHS: [usize; 4] = [2, 4, 8, 16];
static FANOUT: usize = 8;

struct BenchId(pub &'static str, pub usize);

impl fmt::Display for BenchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.0, self.1)
    }
}

/// Builds a trie holding `FANOUT` random chains of `depth` segments each.
/// Returns the trie and the leaf paths.
fn build_trie(depth: usize) -> (PathTrie<u64>, Vec<String>) {
    let mut rng = rand::thread_rng();
    let mut trie = PathTrie::new();
    let mut leaves = Vec::with_capacity(FANOUT);
    for chain in 0..FANOUT {
        let mut path = String::new();
        for level in 0..depth {
            let segment: u32 = rng.gen();
            path.push_str(&format!("/d{}-{}-{:x}", chain, level, segment));
            trie.insert(&path, chain as u64)
                .expect("benchmark paths are valid");
        }
        leaves.push(path);
    }
    (trie, leaves)
}

fn resolve_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    for depth in DEPTHS {
        let (trie, leaves) = build_trie(depth);
        let mut cache = ResolveCache::new(FANOUT);
        for (i, leaf) in leaves.iter().enumerate() {
            cache.put(leaf, i as u64);
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(BenchId("trie", depth)),
            &leaves,
            |b, leaves| {
                let mut i = 0;
                b.iter(|| {
                    i = (i + 1) % leaves.len();
                    black_box(trie.resolve(&leaves[i]))
                })
            },
        );
        group.bench_with_input(
            BenchmarkId::from_parameter(BenchId("cache", depth)),
            &leaves,
            |b, leaves| {
                let mut i = 0;
                b.iter(|| {
                    i = (i + 1) % leaves.len();
                    black_box(cache.get(&leaves[i]))
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, resolve_bench);
criterion_main!(benches);
