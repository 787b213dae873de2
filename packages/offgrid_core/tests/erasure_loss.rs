//! Loss tolerance of the k-of-n codec on realistic payload sizes
//!
//! Run with:
//!   cargo test --test erasure_loss --release

use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use offgrid::erasure::{decode, encode, ErasureParams, DEFAULT_SHARD_SIZE};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn subsets(n: usize, k: usize) -> Vec<Vec<usize>> {
    fn walk(start: usize, n: usize, k: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            walk(i + 1, n, k, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    walk(0, n, k, &mut Vec::new(), &mut out);
    out
}

fn decode_from(shards: &[Vec<u8>], indices: &[usize], meta: &offgrid::erasure::ErasureMeta) -> Vec<u8> {
    let payloads: Vec<Vec<u8>> = indices.iter().map(|&i| shards[i].clone()).collect();
    decode(&payloads, indices, meta).unwrap()
}

#[test]
fn two_megabytes_survive_any_four_losses() {
    let data = random_bytes(2_000_000);
    let digest = Sha256::digest(&data);
    let params = ErasureParams::new(6, 10, DEFAULT_SHARD_SIZE).unwrap();
    let (shards, meta) = encode(&data, &params).unwrap();
    assert_eq!(shards.len(), 10);

    // every shard the same length, so any of them can stand in for another
    assert!(shards.iter().all(|s| s.len() == shards[0].len()));

    let all = subsets(10, 6);
    assert_eq!(all.len(), 210);
    // data-only, parity-heavy and a random spread of the remaining survivors
    let mut chosen = vec![vec![0, 1, 2, 3, 4, 5], vec![0, 1, 6, 7, 8, 9], vec![4, 5, 6, 7, 8, 9]];
    let mut rng = rand::thread_rng();
    for _ in 0..5 {
        chosen.push(all[rng.gen_range(0..all.len())].clone());
    }

    for survivors in chosen {
        let restored = decode_from(&shards, &survivors, &meta);
        assert_eq!(restored.len(), data.len());
        assert_eq!(Sha256::digest(&restored), digest, "survivors {:?}", survivors);
    }
}

#[test]
fn fewer_than_k_shards_is_an_error() {
    let data = random_bytes(1000);
    let params = ErasureParams::new(4, 6, 64).unwrap();
    let (shards, meta) = encode(&data, &params).unwrap();
    let payloads: Vec<Vec<u8>> = shards[..3].to_vec();
    assert!(decode(&payloads, &[0, 1, 2], &meta).is_err());
}
