//! Reading, labelling, tokenizing and batching of claim datasets.

pub mod encode;
pub mod labels;
pub mod loader;
pub mod reader;

pub use encode::{encode_data, fixed_length_tokenizer, load_tokenizer, EncodedDataset, EncodedExample};
pub use labels::{label_name, LabelValue, LABEL_NAMES, NUM_CLASSES};
pub use loader::{create_data_loader, stream_seed, Batch, BatchIter, DataLoader};
pub use reader::{
    load_test_data, process_labels, write_labeled_csv, DataReader, LabeledDataset, LabeledRecord,
    RawDataset, RawRecord,
};
