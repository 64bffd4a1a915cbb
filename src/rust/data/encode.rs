use log::error;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::error::{PipelineError, Result};
use crate::model_manager::{resolve_bundle_file, TOKENIZER_FILE};

/// One tokenized example. `input_ids` and `attention_mask` always hold
/// exactly `max_length` entries.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedExample {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub label: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedDataset {
    pub examples: Vec<EncodedExample>,
    pub max_length: usize,
}

impl EncodedDataset {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// Loads a tokenizer from a `tokenizer.json`, a bundle directory or a
/// downloaded built-in model.
pub fn load_tokenizer(spec: &str) -> Result<Tokenizer> {
    let path = resolve_bundle_file(spec, TOKENIZER_FILE)?;
    Tokenizer::from_file(&path).map_err(|e| {
        error!("Failed to load tokenizer from {:?}: {}", path, e);
        PipelineError::Tokenization(format!("failed to load {:?}: {}", path, e))
    })
}

/// Returns a copy of `tokenizer` that pads and truncates every input to
/// exactly `max_length` tokens.
pub fn fixed_length_tokenizer(tokenizer: &Tokenizer, max_length: usize) -> Result<Tokenizer> {
    let mut tokenizer = tokenizer.clone();

    let mut padding = tokenizer.get_padding().cloned().unwrap_or_else(|| {
        let mut params = PaddingParams::default();
        if let Some(pad_id) = tokenizer.token_to_id("[PAD]") {
            params.pad_id = pad_id;
            params.pad_token = "[PAD]".to_string();
        }
        params
    });
    padding.strategy = PaddingStrategy::Fixed(max_length);
    tokenizer.with_padding(Some(padding));

    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(|e| PipelineError::Tokenization(e.to_string()))?;

    Ok(tokenizer)
}

/// Tokenizes `texts` to fixed-length id and mask sequences paired with `labels`.
pub fn encode_data(
    tokenizer: &Tokenizer,
    texts: &[String],
    labels: &[i64],
    max_length: usize,
) -> Result<EncodedDataset> {
    if texts.len() != labels.len() {
        return Err(PipelineError::Tokenization(format!(
            "{} texts but {} labels",
            texts.len(),
            labels.len()
        )));
    }
    let tokenizer = fixed_length_tokenizer(tokenizer, max_length)?;
    let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let encodings = tokenizer.encode_batch(inputs, true).map_err(|e| {
        error!("Error in tokenization: {}", e);
        PipelineError::Tokenization(e.to_string())
    })?;

    let mut examples = Vec::with_capacity(encodings.len());
    for (encoding, &label) in encodings.iter().zip(labels) {
        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();
        if input_ids.len() != max_length || attention_mask.len() != max_length {
            return Err(PipelineError::Tokenization(format!(
                "expected {} tokens, got {}",
                max_length,
                input_ids.len()
            )));
        }
        examples.push(EncodedExample { input_ids, attention_mask, label });
    }

    Ok(EncodedDataset { examples, max_length })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::str::FromStr;

    /// A small word-level tokenizer with BERT special tokens.
    pub(crate) fn test_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                {"id": 0, "content": "[PAD]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
                {"id": 1, "content": "[UNK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
                {"id": 2, "content": "[CLS]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
                {"id": 3, "content": "[SEP]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
                {"id": 4, "content": "[MASK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
            ],
            "normalizer": {"type": "Lowercase"},
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": {"type": "BertProcessing", "sep": ["[SEP]", 3], "cls": ["[CLS]", 2]},
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {
                    "[PAD]": 0, "[UNK]": 1, "[CLS]": 2, "[SEP]": 3, "[MASK]": 4,
                    "text": 5, "a": 6, "b": 7, "the": 8, "climate": 9,
                    "is": 10, "not": 11, "changing": 12, "science": 13, "unreliable": 14,
                    "warming": 15, "good": 16, "fossil": 17, "fuels": 18, "needed": 19
                },
                "unk_token": "[UNK]"
            }
        }"#;
        Tokenizer::from_str(json).unwrap()
    }

    #[test]
    fn test_encode_pads_to_max_length() {
        let tokenizer = test_tokenizer();
        let texts = vec!["Text A".to_string(), "Text B".to_string()];
        let encoded = encode_data(&tokenizer, &texts, &[1, 5], 10).unwrap();

        assert_eq!(encoded.len(), 2);
        for example in &encoded.examples {
            assert_eq!(example.input_ids.len(), 10);
            assert_eq!(example.attention_mask.len(), 10);
        }
        let first = &encoded.examples[0];
        assert_eq!(&first.input_ids[..4], &[2, 5, 6, 3]);
        assert_eq!(&first.attention_mask[..5], &[1, 1, 1, 1, 0]);
        assert!(first.input_ids[4..].iter().all(|&id| id == 0));
        assert_eq!(encoded.examples[1].label, 5);
    }

    #[test]
    fn test_encode_truncates_long_text() {
        let tokenizer = test_tokenizer();
        let texts = vec!["the climate is not changing the science is unreliable".to_string()];
        let encoded = encode_data(&tokenizer, &texts, &[1], 6).unwrap();
        let example = &encoded.examples[0];
        assert_eq!(example.input_ids.len(), 6);
        assert!(example.attention_mask.iter().all(|&m| m == 1));
        assert_eq!(example.input_ids[0], 2);
        assert_eq!(example.input_ids[5], 3);
    }

    #[test]
    fn test_encode_empty_input() {
        let encoded = encode_data(&test_tokenizer(), &[], &[], 8).unwrap();
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let err = encode_data(&test_tokenizer(), &["a".to_string()], &[], 8).unwrap_err();
        assert!(matches!(err, PipelineError::Tokenization(_)));
    }
}
