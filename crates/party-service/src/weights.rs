//! Static model weight/bias share loading. Each party holds its replicated
//! share of the network's weights and biases as whitespace-separated `"x,y"`
//! pair files, one line per layer.
//!
//! Loaded once at construction and kept for the process lifetime — the
//! weight shares are static, so re-reading per request would buy nothing
//! but I/O, and caching removes per-request filesystem jitter from the
//! critical path.

use std::path::Path;

use anyhow::{Context, Result};

use party_core::model::RingSharePair;

pub struct ModelShares {
    /// Flattened in the exact order the shares codec expects to prepend
    /// them: weights of layer 0, biases of layer 0, …, weights of layer L,
    /// biases of layer L.
    pub shares: Vec<RingSharePair>,
}

fn parse_pair_file(path: &Path) -> Result<Vec<Vec<RingSharePair>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading model share file {}", path.display()))?;
    let mut layers = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut pairs = Vec::new();
        for token in line.split_whitespace() {
            let (a, b) = token
                .split_once(',')
                .with_context(|| format!("malformed share pair {token:?} in {}", path.display()))?;
            let a: i64 = a.parse().with_context(|| format!("parsing share component {a:?}"))?;
            let b: i64 = b.parse().with_context(|| format!("parsing share component {b:?}"))?;
            pairs.push((a as u64, b as u64));
        }
        layers.push(pairs);
    }
    Ok(layers)
}

impl ModelShares {
    /// Loads `model_shares_p<party>.txt` and `biases_shares_p<party>.txt`
    /// from `<models_dir>/<analysis_type>/`, interleaving weights then
    /// biases for each layer.
    pub fn load(models_dir: &Path, analysis_type: &str, party_index: u8) -> Result<Self> {
        let dir = models_dir.join(analysis_type);
        let weights = parse_pair_file(&dir.join(format!("model_shares_p{party_index}.txt")))?;
        let biases = parse_pair_file(&dir.join(format!("biases_shares_p{party_index}.txt")))?;
        if weights.len() != biases.len() {
            anyhow::bail!(
                "model has {} weight layers but {} bias layers",
                weights.len(),
                biases.len()
            );
        }

        let mut shares = Vec::new();
        for (weight_layer, bias_layer) in weights.into_iter().zip(biases) {
            shares.extend(weight_layer);
            shares.extend(bias_layer);
        }
        Ok(Self { shares })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaves_weights_then_biases_per_layer() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("Heartbeat-Demo-1");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("model_shares_p0.txt"), "1,2 3,4\n5,6\n").unwrap();
        std::fs::write(model_dir.join("biases_shares_p0.txt"), "7,8\n9,10\n").unwrap();

        let model = ModelShares::load(dir.path(), "Heartbeat-Demo-1", 0).unwrap();
        assert_eq!(
            model.shares,
            vec![(1, 2), (3, 4), (7, 8), (5, 6), (9, 10)]
        );
    }

    #[test]
    fn mismatched_layer_counts_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("Heartbeat-Demo-1");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("model_shares_p0.txt"), "1,2\n3,4\n").unwrap();
        std::fs::write(model_dir.join("biases_shares_p0.txt"), "7,8\n").unwrap();

        assert!(ModelShares::load(dir.path(), "Heartbeat-Demo-1", 0).is_err());
    }
}
