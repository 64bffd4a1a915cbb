//! Class balancing through text augmentation, and the K-fold driver that
//! produces balanced training folds.

mod balance;
mod contextual;
mod kfold;
mod swap;

pub use balance::{balance_dataset, BalanceOutcome};
pub use contextual::ContextualWordAugmenter;
pub use kfold::{augment_folds, kfold_splits, FoldArtifacts, FoldSplit};
pub use swap::RandomSwapAugmenter;

use crate::error::Result;

/// Produces a variant of a text that keeps its label.
///
/// `Ok(None)` means no variant could be produced for this input; the
/// balancer skips it. Errors abort balancing.
pub trait TextAugmenter {
    fn augment(&self, text: &str) -> Result<Option<String>>;
}

impl<T: TextAugmenter + ?Sized> TextAugmenter for Box<T> {
    fn augment(&self, text: &str) -> Result<Option<String>> {
        (**self).augment(text)
    }
}

impl<T: TextAugmenter + ?Sized> TextAugmenter for &T {
    fn augment(&self, text: &str) -> Result<Option<String>> {
        (**self).augment(text)
    }
}

/// Strips list-literal wrapping (`['...']`) some augmenters leave behind.
pub(crate) fn clean_augmented(text: &str) -> String {
    let text = text.strip_prefix("['").unwrap_or(text);
    let text = text.strip_suffix("']").unwrap_or(text);
    text.to_string()
}
