// ============================================================
// Layer 4 — K-Fold Splitter
// ============================================================
// Shuffles the sample pairs once with the run seed and cuts them
// into k contiguous chunks. Fold i validates on chunk i and
// trains on the other k-1 chunks:
//
//   shuffled: [ c0 | c1 | c2 | c3 | c4 ]
//   fold 0:   valid = c0, train = c1 c2 c3 c4
//   fold 1:   valid = c1, train = c0 c2 c3 c4
//   ...
//
// Chunk sizes differ by at most one; the first n % k chunks get
// the extra sample.
//
// Uses Fisher-Yates shuffle via rand::seq::SliceRandom on a
// seeded StdRng, so the same seed always yields the same folds.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::domain::sample::{FoldSplit, SamplePair};

/// Partition `samples` into `k` train/validation folds.
/// With fewer samples than folds the trailing folds get an empty
/// validation set; callers decide whether that is acceptable.
pub fn kfold_split(samples: &[SamplePair], k: usize, seed: u64) -> Vec<FoldSplit> {
    let k = k.max(1);
    let mut shuffled = samples.to_vec();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

    let n    = shuffled.len();
    let base = n / k;
    let rem  = n % k;

    let mut bounds = Vec::with_capacity(k + 1);
    bounds.push(0usize);
    for i in 0..k {
        let size = base + usize::from(i < rem);
        bounds.push(bounds[i] + size);
    }

    let folds: Vec<FoldSplit> = (0..k)
        .map(|i| {
            let (lo, hi) = (bounds[i], bounds[i + 1]);
            let valid = shuffled[lo..hi].to_vec();
            let train = shuffled[..lo]
                .iter()
                .chain(shuffled[hi..].iter())
                .cloned()
                .collect();
            FoldSplit { index: i, train, valid }
        })
        .collect();

    tracing::debug!(
        "Split {} samples into {} folds ({}..={} validation samples each)",
        n, k, base, base + usize::from(rem > 0),
    );
    folds
}

/// A single fold built from an explicit hold-out set.
pub fn holdout_split(train: Vec<SamplePair>, valid: Vec<SamplePair>) -> FoldSplit {
    FoldSplit { index: 0, train, valid }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pairs(n: usize) -> Vec<SamplePair> {
        (0..n)
            .map(|i| SamplePair::new(format!("case_{i:03}"), format!("mri/{i}.nii.gz"), None))
            .collect()
    }

    #[test]
    fn test_folds_are_disjoint_and_complete() {
        for n in [0usize, 1, 4, 5, 7, 23] {
            let all   = pairs(n);
            let folds = kfold_split(&all, 5, 9300);
            assert_eq!(folds.len(), 5);

            for fold in &folds {
                let train: HashSet<_> = fold.train.iter().map(|p| &p.id).collect();
                let valid: HashSet<_> = fold.valid.iter().map(|p| &p.id).collect();
                assert!(train.is_disjoint(&valid));
                assert_eq!(fold.total(), n);
            }
        }
    }

    #[test]
    fn test_every_sample_validated_exactly_once() {
        let all   = pairs(12);
        let folds = kfold_split(&all, 5, 1);
        let mut seen: Vec<String> = folds
            .iter()
            .flat_map(|f| f.valid.iter().map(|p| p.id.clone()))
            .collect();
        seen.sort();
        let expected: Vec<String> = all.iter().map(|p| p.id.clone()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_chunk_sizes_balanced() {
        let folds = kfold_split(&pairs(12), 5, 1);
        let sizes: Vec<usize> = folds.iter().map(|f| f.valid.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2, 2]);
    }

    #[test]
    fn test_same_seed_same_folds() {
        let a = kfold_split(&pairs(10), 5, 42);
        let b = kfold_split(&pairs(10), 5, 42);
        for (fa, fb) in a.iter().zip(b.iter()) {
            assert_eq!(fa.valid, fb.valid);
        }
    }

    #[test]
    fn test_holdout_is_fold_zero() {
        let fold = holdout_split(pairs(3), pairs(1));
        assert_eq!(fold.index, 0);
        assert_eq!(fold.total(), 4);
    }
}
