//! Systematic Reed-Solomon encode/decode
//!
//! The input is zero-padded to a multiple of `k * shard_size` and cut into
//! blocks. Within a block the first `k` shards are the data itself and the
//! remaining `n - k` are parity rows applied to it. Shard `i` of the asset is
//! the concatenation of shard `i` from every block, so one shard index maps to
//! one storage endpoint regardless of asset size.

use serde::{Deserialize, Serialize};

use super::galois::FIELD;
use super::matrix::Matrix;
use super::CodecError;

pub const DEFAULT_K: usize = 12;
pub const DEFAULT_N: usize = 20;
pub const DEFAULT_SHARD_SIZE: usize = 64 * 1024;

/// Validated `(k, n, shard_size)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureParams {
    pub k: usize,
    pub n: usize,
    pub shard_size: usize,
}

impl ErasureParams {
    pub fn new(k: usize, n: usize, shard_size: usize) -> Result<Self, CodecError> {
        if k == 0 || k >= n {
            return Err(CodecError::InvalidParameters(format!(
                "need 0 < k < n, got k={} n={}",
                k, n
            )));
        }
        if n > 255 {
            return Err(CodecError::InvalidParameters(format!(
                "n={} exceeds the 255 distinct elements of GF(256)",
                n
            )));
        }
        if shard_size == 0 {
            return Err(CodecError::InvalidParameters(
                "shard_size must be positive".to_string(),
            ));
        }
        Ok(Self { k, n, shard_size })
    }

    pub fn parity_shards(&self) -> usize {
        self.n - self.k
    }

    /// Bytes of input consumed per block.
    pub fn block_size(&self) -> usize {
        self.k * self.shard_size
    }
}

impl Default for ErasureParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            n: DEFAULT_N,
            shard_size: DEFAULT_SHARD_SIZE,
        }
    }
}

/// Everything a decoder needs besides the shards themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureMeta {
    pub k: usize,
    pub n: usize,
    pub shard_size: usize,
    pub orig_len: usize,
    pub pad: usize,
    pub systematic: bool,
    /// `(n - k) x k` coefficients producing parity shards from data shards
    pub parity_matrix: Vec<Vec<u8>>,
}

impl ErasureMeta {
    pub fn params(&self) -> Result<ErasureParams, CodecError> {
        ErasureParams::new(self.k, self.n, self.shard_size)
    }

    /// Expected length of every shard of this asset.
    pub fn shard_len(&self) -> usize {
        (self.orig_len + self.pad) / self.k
    }
}

/// Redundancy profile used when sizing `(k, n)` from the number of hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementTarget {
    Fast,
    Balanced,
    Durable,
}

impl std::str::FromStr for PlacementTarget {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(PlacementTarget::Fast),
            "balanced" => Ok(PlacementTarget::Balanced),
            "durable" => Ok(PlacementTarget::Durable),
            other => Err(CodecError::InvalidParameters(format!(
                "unknown placement target: {}",
                other
            ))),
        }
    }
}

/// Pick `(k, n)` for `host_count` available hosts.
///
/// With two or fewer hosts this returns `(1, host_count)`; callers should
/// fall back to replication whenever the result has `k >= n`.
pub fn choose_k_n(host_count: usize, target: PlacementTarget) -> (usize, usize) {
    let m = host_count;
    if m <= 2 {
        return (1, m.max(1));
    }
    // ceil(n * tenths / 10) in integers
    let ceil_frac = |n: usize, tenths: usize| (n * tenths + 9) / 10;
    match target {
        PlacementTarget::Fast => {
            let n = m.min(6);
            (ceil_frac(n, 5).max(2), n)
        }
        PlacementTarget::Balanced => {
            let n = m.min(10);
            (ceil_frac(n, 6).max(3), n)
        }
        PlacementTarget::Durable => {
            let n = m.min(12);
            (ceil_frac(n, 7).max(3), n)
        }
    }
}

/// Parity rows of the systematic generator for `(k, n)`.
///
/// Built as `B * T^-1` where `T` and `B` are the top `k` and bottom `n - k`
/// rows of an `n x k` Vandermonde matrix. Right-multiplying by `T^-1` keeps
/// every `k`-row selection invertible and turns the top block into the
/// identity. This is the systematic form of a Vandermonde (MDS) code: the
/// data shards are stored as-is rather than as Vandermonde rows times data.
pub fn parity_matrix(params: &ErasureParams) -> Result<Matrix, CodecError> {
    let vandermonde = Matrix::vandermonde(params.n, params.k);
    let top_inv = vandermonde.sub_rows(0, params.k).invert()?;
    vandermonde.sub_rows(params.k, params.n).multiply(&top_inv)
}

/// Split `data` into `n` shards; any `k` of them reconstruct it.
pub fn encode(data: &[u8], params: &ErasureParams) -> Result<(Vec<Vec<u8>>, ErasureMeta), CodecError> {
    let params = ErasureParams::new(params.k, params.n, params.shard_size)?;
    let k = params.k;
    let ss = params.shard_size;
    let block = params.block_size();

    let pad = (block - data.len() % block) % block;
    let blocks = (data.len() + pad) / block;
    let shard_len = blocks * ss;

    // De-interleave: data shard j holds slice j of every block.
    let mut shards: Vec<Vec<u8>> = vec![Vec::with_capacity(shard_len); params.n];
    for b in 0..blocks {
        for (j, shard) in shards.iter_mut().take(k).enumerate() {
            let start = (b * block + j * ss).min(data.len());
            let end = (b * block + (j + 1) * ss).min(data.len());
            shard.extend_from_slice(&data[start..end]);
            shard.resize((b + 1) * ss, 0);
        }
    }

    let parity = parity_matrix(&params)?;
    let (data_shards, parity_shards) = shards.split_at_mut(k);
    for (p, out) in parity_shards.iter_mut().enumerate() {
        out.resize(shard_len, 0);
        for (j, src) in data_shards.iter().enumerate() {
            FIELD.mul_add_slice(parity.get(p, j), src, out);
        }
    }

    let meta = ErasureMeta {
        k,
        n: params.n,
        shard_size: ss,
        orig_len: data.len(),
        pad,
        systematic: true,
        parity_matrix: parity.to_rows(),
    };
    Ok((shards, meta))
}

/// Reconstruct the original bytes from at least `k` shards.
///
/// `payloads[i]` is the shard at index `indices[i]`. Duplicate indices are
/// ignored; the first `k` distinct ones are used.
pub fn decode(payloads: &[Vec<u8>], indices: &[usize], meta: &ErasureMeta) -> Result<Vec<u8>, CodecError> {
    if payloads.len() != indices.len() {
        return Err(CodecError::PayloadCountMismatch {
            payloads: payloads.len(),
            indices: indices.len(),
        });
    }
    let params = meta.params()?;
    let k = params.k;
    if meta.parity_matrix.len() != params.parity_shards()
        || meta.parity_matrix.iter().any(|row| row.len() != k)
    {
        return Err(CodecError::InvalidMeta(format!(
            "parity matrix must be {}x{}",
            params.parity_shards(),
            k
        )));
    }
    if (meta.orig_len + meta.pad) % params.block_size() != 0 {
        return Err(CodecError::InvalidMeta(format!(
            "orig_len {} + pad {} is not a whole number of blocks",
            meta.orig_len, meta.pad
        )));
    }

    let mut chosen: Vec<(usize, &[u8])> = Vec::with_capacity(k);
    for (&index, payload) in indices.iter().zip(payloads) {
        if index >= params.n {
            return Err(CodecError::InvalidShardIndex { index, n: params.n });
        }
        if chosen.iter().any(|(seen, _)| *seen == index) {
            continue;
        }
        chosen.push((index, payload.as_slice()));
        if chosen.len() == k {
            break;
        }
    }
    if chosen.len() < k {
        return Err(CodecError::InsufficientShards {
            have: chosen.len(),
            need: k,
        });
    }

    let shard_len = meta.shard_len();
    if let Some((index, payload)) = chosen.iter().find(|(_, p)| p.len() != shard_len) {
        return Err(CodecError::ShardLengthMismatch(format!(
            "shard {} has {} bytes, expected {}",
            index,
            payload.len(),
            shard_len
        )));
    }

    let mut rows = Matrix::zeros(k, k);
    for (r, (index, _)) in chosen.iter().enumerate() {
        if *index < k {
            rows.set(r, *index, 1);
        } else {
            for (c, &coefficient) in meta.parity_matrix[*index - k].iter().enumerate() {
                rows.set(r, c, coefficient);
            }
        }
    }
    let decoder = rows.invert()?;

    let mut data_shards = vec![vec![0u8; shard_len]; k];
    for (j, out) in data_shards.iter_mut().enumerate() {
        for (r, (_, payload)) in chosen.iter().enumerate() {
            FIELD.mul_add_slice(decoder.get(j, r), payload, out);
        }
    }

    // Re-interleave block by block, then drop the padding.
    let ss = params.shard_size;
    let blocks = shard_len / ss;
    let mut out = Vec::with_capacity(blocks * params.block_size());
    for b in 0..blocks {
        for shard in &data_shards {
            out.extend_from_slice(&shard[b * ss..(b + 1) * ss]);
        }
    }
    out.truncate(meta.orig_len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    /// Every k-subset of 0..n, in lexicographic order.
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

    #[test]
    fn test_params_validation() {
        assert!(ErasureParams::new(0, 4, 16).is_err());
        assert!(ErasureParams::new(4, 4, 16).is_err());
        assert!(ErasureParams::new(5, 4, 16).is_err());
        assert!(ErasureParams::new(4, 256, 16).is_err());
        assert!(ErasureParams::new(4, 8, 0).is_err());
        assert!(ErasureParams::new(254, 255, 1).is_ok());

        let defaults = ErasureParams::default();
        assert_eq!((defaults.k, defaults.n, defaults.shard_size), (12, 20, 65536));
    }

    #[test]
    fn test_encode_is_systematic() {
        let params = ErasureParams::new(3, 5, 4).unwrap();
        let data: Vec<u8> = (1..=12).collect();
        let (shards, meta) = encode(&data, &params).unwrap();

        assert_eq!(shards.len(), 5);
        assert_eq!(shards[0], vec![1, 2, 3, 4]);
        assert_eq!(shards[1], vec![5, 6, 7, 8]);
        assert_eq!(shards[2], vec![9, 10, 11, 12]);
        assert_eq!(meta.pad, 0);
        assert!(meta.systematic);
        assert_eq!(meta.parity_matrix.len(), 2);
    }

    #[test]
    fn test_padding_recorded() {
        let params = ErasureParams::new(4, 6, 8).unwrap();
        let data = random_bytes(70);
        let (shards, meta) = encode(&data, &params).unwrap();

        // two blocks of 32 bytes would hold 64, so three blocks are needed
        assert_eq!(meta.pad, 96 - 70);
        assert!(shards.iter().all(|s| s.len() == 24));
        assert_eq!(meta.shard_len(), 24);
    }

    #[test]
    fn test_every_k_subset_roundtrip() {
        for &(k, n) in &[(1usize, 2usize), (2, 4), (3, 5), (4, 7), (5, 8)] {
            let params = ErasureParams::new(k, n, 16).unwrap();
            let len = 1 + (rand::thread_rng().next_u32() as usize % 300);
            let data = random_bytes(len);
            let (shards, meta) = encode(&data, &params).unwrap();

            for subset in subsets(n, k) {
                let payloads: Vec<Vec<u8>> = subset.iter().map(|&i| shards[i].clone()).collect();
                let decoded = decode(&payloads, &subset, &meta).unwrap();
                assert_eq!(decoded, data, "k={} n={} subset={:?}", k, n, subset);
            }
        }
    }

    #[test]
    fn test_generator_rows_are_mds() {
        for &(k, n) in &[(2usize, 4usize), (3, 6), (4, 8)] {
            let params = ErasureParams::new(k, n, 1).unwrap();
            let mut rows = Matrix::identity(k).to_rows();
            rows.extend(parity_matrix(&params).unwrap().to_rows());
            for subset in subsets(n, k) {
                let selected: Vec<Vec<u8>> = subset.iter().map(|&i| rows[i].clone()).collect();
                assert!(
                    Matrix::from_rows(&selected).unwrap().invert().is_ok(),
                    "k={} n={} subset={:?}",
                    k,
                    n,
                    subset
                );
            }
        }
    }

    #[test]
    fn test_unordered_indices_decode() {
        let params = ErasureParams::new(3, 6, 10).unwrap();
        let data = random_bytes(95);
        let (shards, meta) = encode(&data, &params).unwrap();

        let indices = vec![5, 1, 3];
        let payloads: Vec<Vec<u8>> = indices.iter().map(|&i| shards[i].clone()).collect();
        assert_eq!(decode(&payloads, &indices, &meta).unwrap(), data);
    }

    #[test]
    fn test_duplicate_indices_do_not_count() {
        let params = ErasureParams::new(3, 5, 8).unwrap();
        let data = random_bytes(40);
        let (shards, meta) = encode(&data, &params).unwrap();

        let indices = vec![0, 0, 4];
        let payloads: Vec<Vec<u8>> = indices.iter().map(|&i| shards[i].clone()).collect();
        let err = decode(&payloads, &indices, &meta).unwrap_err();
        assert!(matches!(err, CodecError::InsufficientShards { have: 2, need: 3 }));

        let indices = vec![0, 0, 4, 2];
        let payloads: Vec<Vec<u8>> = indices.iter().map(|&i| shards[i].clone()).collect();
        assert_eq!(decode(&payloads, &indices, &meta).unwrap(), data);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let params = ErasureParams::new(2, 4, 8).unwrap();
        let data = random_bytes(30);
        let (shards, meta) = encode(&data, &params).unwrap();

        let err = decode(&[shards[0].clone()], &[0, 1], &meta).unwrap_err();
        assert!(matches!(err, CodecError::PayloadCountMismatch { .. }));

        let err = decode(&[shards[0].clone(), shards[1].clone()], &[0, 9], &meta).unwrap_err();
        assert!(matches!(err, CodecError::InvalidShardIndex { index: 9, n: 4 }));

        let mut short = shards[1].clone();
        short.pop();
        let err = decode(&[shards[0].clone(), short], &[0, 1], &meta).unwrap_err();
        assert!(matches!(err, CodecError::ShardLengthMismatch(_)));
    }

    #[test]
    fn test_empty_input() {
        let params = ErasureParams::new(2, 3, 8).unwrap();
        let (shards, meta) = encode(&[], &params).unwrap();
        assert!(shards.iter().all(|s| s.is_empty()));
        let decoded = decode(&[shards[2].clone(), shards[1].clone()], &[2, 1], &meta).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_meta_serializes() {
        let params = ErasureParams::new(2, 3, 8).unwrap();
        let (_, meta) = encode(b"hello world", &params).unwrap();
        let json = serde_json::to_string(&meta).unwrap();
        let back: ErasureMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_choose_k_n() {
        assert_eq!(choose_k_n(0, PlacementTarget::Balanced), (1, 1));
        assert_eq!(choose_k_n(2, PlacementTarget::Durable), (1, 2));
        assert_eq!(choose_k_n(4, PlacementTarget::Fast), (2, 4));
        assert_eq!(choose_k_n(20, PlacementTarget::Fast), (3, 6));
        assert_eq!(choose_k_n(20, PlacementTarget::Balanced), (6, 10));
        assert_eq!(choose_k_n(20, PlacementTarget::Durable), (9, 12));
        // too few hosts for the target: k reaches n, caller replicates
        let (k, n) = choose_k_n(3, PlacementTarget::Balanced);
        assert!(k >= n);
    }

    #[test]
    fn test_placement_target_parse() {
        assert_eq!("durable".parse::<PlacementTarget>().unwrap(), PlacementTarget::Durable);
        assert!("reckless".parse::<PlacementTarget>().is_err());
    }
}
