use log::{info, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use super::{clean_augmented, TextAugmenter};
use crate::data::{LabeledDataset, LabeledRecord};
use crate::error::{PipelineError, Result};

/// Result of balancing one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceOutcome {
    /// Original records followed by the augmented ones.
    pub dataset: LabeledDataset,
    pub augmented: usize,
    /// Draws for which the augmenter produced no variant.
    pub skipped: usize,
}

/// Tops every class up to the size of the largest one.
///
/// For each class with a deficit, `deficit` source rows are drawn with
/// replacement from that class and augmented; the variants keep the source
/// label. When the augmenter yields nothing for a draw it is skipped and
/// counted, so classes are exactly equal only when `skipped == 0`.
pub fn balance_dataset<A, R>(dataset: &LabeledDataset, augmenter: &A, rng: &mut R) -> Result<BalanceOutcome>
where
    A: TextAugmenter + ?Sized,
    R: Rng + ?Sized,
{
    let counts = dataset.class_counts();
    let Some(&max_count) = counts.values().max() else {
        return Ok(BalanceOutcome {
            dataset: dataset.clone(),
            augmented: 0,
            skipped: 0,
        });
    };

    let mut records = dataset.records.clone();
    let mut augmented = 0;
    let mut skipped = 0;

    for (&label, &count) in &counts {
        let deficit = max_count - count;
        if deficit == 0 {
            continue;
        }
        let pool: Vec<&LabeledRecord> = dataset
            .records
            .iter()
            .filter(|r| r.numeric_label == label)
            .collect();
        info!("Augmenting class {}: {} -> {} records", label, count, max_count);

        for _ in 0..deficit {
            let Some(source) = pool.choose(rng) else {
                break;
            };
            let variant = augmenter.augment(&source.text).map_err(|e| match e {
                PipelineError::Augmentation(_) => e,
                other => PipelineError::Augmentation(other.to_string()),
            })?;
            match variant {
                Some(text) => {
                    records.push(LabeledRecord {
                        text: clean_augmented(&text),
                        numeric_label: label,
                    });
                    augmented += 1;
                }
                None => {
                    warn!("Augmenter produced no variant for class {}, skipping", label);
                    skipped += 1;
                }
            }
        }
    }

    Ok(BalanceOutcome {
        dataset: LabeledDataset {
            text_column: dataset.text_column.clone(),
            label_column: dataset.label_column.clone(),
            records,
        },
        augmented,
        skipped,
    })
}
