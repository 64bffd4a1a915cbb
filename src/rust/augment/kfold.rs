use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{balance_dataset, TextAugmenter};
use crate::data::{write_labeled_csv, LabeledDataset};
use crate::error::{PipelineError, Result};

/// Train and test indices of one fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Splits `0..n` into `k` folds.
///
/// The first `n % k` folds hold one extra index. With `shuffle` the
/// indices are permuted with a generator seeded by `seed` first.
pub fn kfold_splits(n: usize, k: usize, shuffle: bool, seed: u64) -> Result<Vec<FoldSplit>> {
    if k < 2 {
        return Err(PipelineError::InvalidConfig(format!("n_splits must be at least 2, got {}", k)));
    }
    if n < k {
        return Err(PipelineError::InvalidConfig(format!(
            "cannot split {} samples into {} folds",
            n, k
        )));
    }

    let mut indices: Vec<usize> = (0..n).collect();
    if shuffle {
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
    }

    let mut splits = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let size = n / k + usize::from(fold < n % k);
        let end = start + size;
        let test = indices[start..end].to_vec();
        let train = indices[..start].iter().chain(&indices[end..]).copied().collect();
        splits.push(FoldSplit { train, test });
        start = end;
    }
    Ok(splits)
}

/// Files written for one fold.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldArtifacts {
    pub fold: usize,
    pub subset_path: PathBuf,
    pub balanced_path: PathBuf,
    pub subset_len: usize,
    pub balanced_len: usize,
    pub skipped: usize,
}

/// Partitions `dataset` into `n_splits` shuffled folds and balances each
/// fold's held-out subset independently. Fold `i` (starting at 1) is
/// written as `df{i}.csv` and `df_balanced{i}.csv` under `output_dir`.
pub fn augment_folds<A: TextAugmenter + ?Sized>(
    dataset: &LabeledDataset,
    augmenter: &A,
    n_splits: usize,
    seed: u64,
    output_dir: &Path,
) -> Result<Vec<FoldArtifacts>> {
    fs::create_dir_all(output_dir)?;
    let splits = kfold_splits(dataset.len(), n_splits, true, seed)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut artifacts = Vec::with_capacity(splits.len());
    for (i, split) in splits.iter().enumerate() {
        let fold = i + 1;
        let subset = dataset.subset(&split.test);
        let outcome = balance_dataset(&subset, augmenter, &mut rng)?;

        let subset_path = output_dir.join(format!("df{}.csv", fold));
        let balanced_path = output_dir.join(format!("df_balanced{}.csv", fold));
        write_labeled_csv(&subset, &subset_path)?;
        write_labeled_csv(&outcome.dataset, &balanced_path)?;
        info!("Saved: {:?} & {:?}", subset_path, balanced_path);

        artifacts.push(FoldArtifacts {
            fold,
            subset_path,
            balanced_path,
            subset_len: subset.len(),
            balanced_len: outcome.dataset.len(),
            skipped: outcome.skipped,
        });
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{process_labels, DataReader, LabeledRecord};
    use crate::error::Result;
    use tempfile::tempdir;

    struct Echo;

    impl TextAugmenter for Echo {
        fn augment(&self, text: &str) -> Result<Option<String>> {
            Ok(Some(format!("{} again", text)))
        }
    }

    #[test]
    fn test_fold_sizes_follow_remainder_rule() {
        let splits = kfold_splits(11, 3, false, 0).unwrap();
        let sizes: Vec<usize> = splits.iter().map(|s| s.test.len()).collect();
        assert_eq!(sizes, vec![4, 4, 3]);
        assert_eq!(splits[0].test, vec![0, 1, 2, 3]);
        assert_eq!(splits[2].train, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_folds_partition_all_indices() {
        let splits = kfold_splits(23, 5, true, 42).unwrap();
        let mut seen: Vec<usize> = splits.iter().flat_map(|s| s.test.clone()).collect();
        seen.sort();
        assert_eq!(seen, (0..23).collect::<Vec<_>>());
        for split in &splits {
            assert_eq!(split.train.len() + split.test.len(), 23);
            assert!(split.test.iter().all(|i| !split.train.contains(i)));
        }
        assert_eq!(splits, kfold_splits(23, 5, true, 42).unwrap());
    }

    #[test]
    fn test_invalid_fold_counts() {
        assert!(kfold_splits(10, 1, true, 0).is_err());
        assert!(kfold_splits(2, 3, true, 0).is_err());
    }

    #[test]
    fn test_augment_folds_writes_balanced_csvs() {
        let dir = tempdir().unwrap();
        let records = (0..12)
            .map(|i| LabeledRecord {
                text: format!("claim {}", i),
                numeric_label: if i % 4 == 0 { 1 } else { 0 },
            })
            .collect();
        let dataset = LabeledDataset::new("quote", "label", records);

        let artifacts = augment_folds(&dataset, &Echo, 3, 7, dir.path()).unwrap();
        assert_eq!(artifacts.len(), 3);
        assert_eq!(artifacts[0].subset_path, dir.path().join("df1.csv"));
        assert_eq!(artifacts[2].balanced_path, dir.path().join("df_balanced3.csv"));
        assert_eq!(artifacts.iter().map(|a| a.subset_len).sum::<usize>(), 12);

        for artifact in &artifacts {
            let balanced = process_labels(DataReader::default().read(&artifact.balanced_path, "label").unwrap())
                .unwrap();
            assert_eq!(balanced.len(), artifact.balanced_len);
            let counts = balanced.class_counts();
            let max = counts.values().max().copied().unwrap_or(0);
            assert!(counts.values().all(|&c| c == max));
        }
    }
}
