use std::cell::RefCell;
use std::path::Path;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_bert::distilbert::DistilBertModelMaskedLM;
use tch::{nn, Device, Tensor};
use tokenizers::Tokenizer;

use super::TextAugmenter;
use crate::config::AugmentAction;
use crate::data::fixed_length_tokenizer;
use crate::error::{PipelineError, Result};
use crate::model::load_architecture;
use crate::model_manager::{CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE};

const MASK_TOKEN: &str = "[MASK]";
const CANDIDATES: i64 = 10;

/// Inserts or substitutes one word using a masked language model's best
/// in-context prediction.
pub struct ContextualWordAugmenter {
    model: DistilBertModelMaskedLM,
    _vs: nn::VarStore,
    tokenizer: Tokenizer,
    mask_id: u32,
    action: AugmentAction,
    device: Device,
    rng: RefCell<StdRng>,
}

impl ContextualWordAugmenter {
    /// Loads a DistilBERT masked-LM bundle (`config.json`, weights,
    /// `tokenizer.json`) from `dir`.
    pub fn from_bundle(
        dir: &Path,
        action: AugmentAction,
        device: Device,
        max_length: usize,
        seed: u64,
    ) -> Result<Self> {
        let architecture = load_architecture(&dir.join(CONFIG_FILE))?;
        let weights = dir.join(WEIGHTS_FILE);
        if !weights.exists() {
            return Err(PipelineError::WeightsNotFound { path: weights });
        }

        let mut vs = nn::VarStore::new(device);
        let model = DistilBertModelMaskedLM::new(vs.root(), &architecture);
        vs.load(&weights)?;
        vs.freeze();

        let tokenizer = Tokenizer::from_file(dir.join(TOKENIZER_FILE))
            .map_err(|e| PipelineError::Tokenization(e.to_string()))?;
        let tokenizer = fixed_length_tokenizer(&tokenizer, max_length)?;
        let mask_id = tokenizer.token_to_id(MASK_TOKEN).ok_or_else(|| {
            PipelineError::Tokenization(format!("tokenizer has no {} token", MASK_TOKEN))
        })?;
        info!("Loaded contextual augmenter from {:?} ({:?}, {:?})", dir, action, device);

        Ok(Self {
            model,
            _vs: vs,
            tokenizer,
            mask_id,
            action,
            device,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Highest-ranked whole-word prediction for the mask token that starts
    /// at byte `mask_offset` of `masked_text`.
    fn predict_mask(&self, masked_text: &str, mask_offset: usize, replaced: Option<&str>) -> Result<Option<String>> {
        let encoding = self
            .tokenizer
            .encode(masked_text, true)
            .map_err(|e| PipelineError::Tokenization(e.to_string()))?;
        let Some(position) = mask_token_index(encoding.get_ids(), encoding.get_offsets(), self.mask_id, mask_offset)
        else {
            debug!("Mask truncated away, skipping");
            return Ok(None);
        };

        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let mask: Vec<i64> = encoding.get_attention_mask().iter().map(|&m| m as i64).collect();
        let input_ids = Tensor::from_slice(&ids).view([1, -1]).to_device(self.device);
        let attention_mask = Tensor::from_slice(&mask).view([1, -1]).to_device(self.device);

        let candidates = tch::no_grad(|| -> Result<Vec<i64>> {
            let output = self
                .model
                .forward_t(Some(&input_ids), Some(&attention_mask), None, false)?;
            let scores = output.prediction_scores.get(0).get(position as i64);
            let (_, top) = scores.topk(CANDIDATES, -1, true, true);
            Ok(Vec::<i64>::try_from(&top.to_device(Device::Cpu))?)
        })?;

        let word = candidates.into_iter().find_map(|id| {
            let token = self.tokenizer.id_to_token(id as u32)?;
            let usable = !token.starts_with('[')
                && !token.starts_with("##")
                && token.chars().any(char::is_alphanumeric)
                && Some(token.as_str()) != replaced.map(str::to_lowercase).as_deref();
            usable.then_some(token)
        });
        Ok(word)
    }
}

impl TextAugmenter for ContextualWordAugmenter {
    fn augment(&self, text: &str) -> Result<Option<String>> {
        let mut words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        if words.is_empty() {
            return Ok(None);
        }

        let (position, replaced) = {
            let mut rng = self.rng.borrow_mut();
            match self.action {
                AugmentAction::Insert => {
                    let position = rng.gen_range(0..=words.len());
                    words.insert(position, MASK_TOKEN.to_string());
                    (position, None)
                }
                AugmentAction::Substitute => {
                    let position = rng.gen_range(0..words.len());
                    let replaced = std::mem::replace(&mut words[position], MASK_TOKEN.to_string());
                    (position, Some(replaced))
                }
            }
        };

        let masked_text = words.join(" ");
        let Some(prediction) = self.predict_mask(&masked_text, word_offset(&words, position), replaced.as_deref())?
        else {
            return Ok(None);
        };
        words[position] = prediction;
        Ok(Some(words.join(" ")))
    }
}

/// Byte offset of `words[position]` in `words.join(" ")`.
fn word_offset(words: &[String], position: usize) -> usize {
    words[..position].iter().map(|w| w.len() + 1).sum()
}

/// Index of the mask token starting at `offset`. Text that already holds a
/// literal mask token is left alone.
fn mask_token_index(ids: &[u32], offsets: &[(usize, usize)], mask_id: u32, offset: usize) -> Option<usize> {
    ids.iter()
        .zip(offsets)
        .position(|(&id, &(start, _))| id == mask_id && start == offset)
}
