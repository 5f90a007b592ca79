use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use p256::NistP256;
use rand_core::OsRng;

use threshold_revoke::config::{RevokeConfig, SubkeySelection};
use threshold_revoke::dealer::{deal_keys, write_dealt_keys};
use threshold_revoke::local;
use threshold_revoke::participants::PeerList;

const USER_ID: &str = "Bench <bench@example.org>";

fn prepare(peers: &PeerList) -> (tempfile::TempDir, RevokeConfig) {
    let dir = tempfile::tempdir().unwrap();
    let threshold = (peers.len() - 1) / 2;
    let keys =
        deal_keys::<NistP256>(&mut OsRng, peers, threshold, USER_ID, b"", 1_700_000_000).unwrap();
    write_dealt_keys(dir.path(), &keys).unwrap();
    let config = RevokeConfig {
        peers: peers.as_slice().to_vec(),
        timeout: Duration::from_secs(10),
        subkeys: SubkeySelection::All,
        key_dir: dir.path().to_path_buf(),
        ..RevokeConfig::default()
    };
    (dir, config)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let peers = PeerList::canonicalize(["a", "b", "c"]).unwrap();

    c.bench_function("deal 3", |b| {
        b.iter(|| deal_keys::<NistP256>(&mut OsRng, &peers, 1, USER_ID, b"", 1_700_000_000))
    });

    for names in [&["a", "b", "c"][..], &["a", "b", "c", "d", "e"][..]] {
        let peers = PeerList::canonicalize(names.iter().copied()).unwrap();
        c.bench_function(&format!("revoke {}", peers.len()), |b| {
            b.iter_batched(
                || prepare(&peers),
                |(dir, config)| {
                    let outcomes = local::revoke_all(&config, &peers);
                    assert!(outcomes.iter().all(|outcome| outcome.result.is_ok()));
                    black_box(dir)
                },
                BatchSize::PerIteration,
            )
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = criterion_benchmark
}
criterion_main!(benches);
