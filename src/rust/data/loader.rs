use std::cell::Cell;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tch::{Device, Tensor};
use tokenizers::Tokenizer;

use super::encode::{encode_data, EncodedDataset};
use super::reader::{process_labels, DataReader};
use crate::config::LoaderSettings;
use crate::error::Result;

/// Derives the seed of stream `stream` (an epoch, a trial) from a base seed.
///
/// Neighbouring base seeds never share streams the way `seed + stream` would.
pub fn stream_seed(seed: u64, stream: u64) -> u64 {
    seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// A contiguous group of examples, flattened row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub labels: Vec<i64>,
    pub seq_len: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `(input_ids, attention_mask, labels)` as int64 tensors on `device`.
    pub fn to_tensors(&self, device: Device) -> (Tensor, Tensor, Tensor) {
        let shape = [self.len() as i64, self.seq_len as i64];
        let input_ids = Tensor::from_slice(&self.input_ids).view(shape).to_device(device);
        let attention_mask = Tensor::from_slice(&self.attention_mask).view(shape).to_device(device);
        let labels = Tensor::from_slice(&self.labels).to_device(device);
        (input_ids, attention_mask, labels)
    }
}

/// Iterates an encoded dataset in batches.
///
/// The last batch may be shorter than `batch_size`; it is never dropped.
/// With `shuffle` set, every call to [`DataLoader::iter`] draws a new
/// permutation from a seeded generator, so runs are reproducible.
#[derive(Debug)]
pub struct DataLoader {
    dataset: EncodedDataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: Cell<u64>,
}

impl DataLoader {
    pub fn new(dataset: EncodedDataset, batch_size: usize, shuffle: bool) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            seed: 42,
            epoch: Cell::new(0),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn dataset(&self) -> &EncodedDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per pass.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_examples(&self) -> usize {
        self.dataset.len()
    }

    pub fn iter(&self) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let epoch = self.epoch.get();
            self.epoch.set(epoch + 1);
            let mut rng = StdRng::seed_from_u64(stream_seed(self.seed, epoch));
            order.shuffle(&mut rng);
        }
        BatchIter { loader: self, order, position: 0 }
    }
}

pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    position: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let seq_len = self.loader.dataset.max_length;
        let count = end - self.position;
        let mut batch = Batch {
            input_ids: Vec::with_capacity(count * seq_len),
            attention_mask: Vec::with_capacity(count * seq_len),
            labels: Vec::with_capacity(count),
            seq_len,
        };
        for &index in &self.order[self.position..end] {
            let example = &self.loader.dataset.examples[index];
            batch.input_ids.extend_from_slice(&example.input_ids);
            batch.attention_mask.extend_from_slice(&example.attention_mask);
            batch.labels.push(example.label);
        }
        self.position = end;
        Some(batch)
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = Batch;
    type IntoIter = BatchIter<'a>;

    fn into_iter(self) -> BatchIter<'a> {
        self.iter()
    }
}

/// Reads, labels, encodes and batches a data file. A directory is read as
/// the balanced folds written by the augmentation step.
pub fn create_data_loader<P: AsRef<Path>>(
    path: P,
    settings: &LoaderSettings,
    tokenizer: &Tokenizer,
    shuffle: bool,
    num_labels: usize,
) -> Result<DataLoader> {
    let path = path.as_ref();
    let reader = DataReader::with_text_column(&settings.text_column);
    let raw = if path.is_dir() {
        reader.read_balanced_folds(path, &settings.label_column)?
    } else {
        reader.read(path, &settings.label_column)?
    };
    let dataset = process_labels(raw)?;
    dataset.check_label_range(num_labels)?;
    let encoded = encode_data(tokenizer, &dataset.texts(), &dataset.labels(), settings.max_length)?;
    Ok(DataLoader::new(encoded, settings.batch_size, shuffle))
}
