use std::cell::RefCell;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::TextAugmenter;
use crate::error::Result;

/// Swaps random pairs of words. Needs no model, so it suits quick runs
/// and tests.
pub struct RandomSwapAugmenter {
    swaps: usize,
    rng: RefCell<StdRng>,
}

impl RandomSwapAugmenter {
    pub fn new(swaps: usize, seed: u64) -> Self {
        Self {
            swaps: swaps.max(1),
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl TextAugmenter for RandomSwapAugmenter {
    fn augment(&self, text: &str) -> Result<Option<String>> {
        let mut words: Vec<&str> = text.split_whitespace().collect();
        if words.len() < 2 {
            return Ok(None);
        }
        let mut rng = self.rng.borrow_mut();
        for _ in 0..self.swaps {
            let a = rng.gen_range(0..words.len());
            let b = rng.gen_range(0..words.len());
            words.swap(a, b);
        }
        Ok(Some(words.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_keeps_the_same_words() {
        let augmenter = RandomSwapAugmenter::new(3, 1);
        let text = "the climate has always changed naturally";
        let variant = augmenter.augment(text).unwrap().unwrap();

        let mut original: Vec<&str> = text.split_whitespace().collect();
        let mut shuffled: Vec<&str> = variant.split_whitespace().collect();
        original.sort();
        shuffled.sort();
        assert_eq!(original, shuffled);
    }

    #[test]
    fn test_short_text_yields_nothing() {
        let augmenter = RandomSwapAugmenter::new(1, 1);
        assert_eq!(augmenter.augment("hoax").unwrap(), None);
        assert_eq!(augmenter.augment("   ").unwrap(), None);
    }
}
