mod common;

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use climate_debunk::augment::{ContextualWordAugmenter, TextAugmenter};
use climate_debunk::config::AugmentAction;
use climate_debunk::data::{create_data_loader, load_tokenizer, process_labels, DataReader};
use climate_debunk::{pipeline, AugmentationConfig, PipelineConfig};
use parquet::arrow::ArrowWriter;
use tch::Device;
use tempfile::tempdir;

/// Writes an imbalanced Parquet file with integer labels: class 0 dominates.
fn write_imbalanced_parquet(path: &Path) {
    let mut quotes = Vec::new();
    let mut labels = Vec::new();
    for i in 0..12 {
        quotes.push(if i % 2 == 0 { "the climate is not changing" } else { "a climate text" });
        labels.push(0i64);
    }
    for _ in 0..4 {
        quotes.push("fossil fuels needed");
        labels.push(7);
    }
    let schema = Arc::new(Schema::new(vec![
        Field::new("quote", DataType::Utf8, false),
        Field::new("label", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(StringArray::from(quotes)), Arc::new(Int64Array::from(labels))],
    )
    .unwrap();
    let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

#[test]
fn test_contextual_augmenter_keeps_words() {
    let root = tempdir().unwrap();
    let bundle = common::write_tiny_bundle(root.path());

    let insert = ContextualWordAugmenter::from_bundle(&bundle, AugmentAction::Insert, Device::Cpu, 16, 1).unwrap();
    for _ in 0..5 {
        if let Some(variant) = insert.augment("the climate is good").unwrap() {
            let words: Vec<&str> = variant.split_whitespace().collect();
            assert_eq!(words.len(), 5);
            assert!(!variant.contains("[MASK]"));
        }
    }

    let substitute =
        ContextualWordAugmenter::from_bundle(&bundle, AugmentAction::Substitute, Device::Cpu, 16, 1).unwrap();
    if let Some(variant) = substitute.augment("warming is good").unwrap() {
        assert_eq!(variant.split_whitespace().count(), 3);
        assert_ne!(variant, "warming is good");
    }
    assert_eq!(substitute.augment("   ").unwrap(), None);
}

#[test]
fn test_augmenter_bundle_without_weights() {
    let root = tempdir().unwrap();
    let bundle = common::write_tiny_bundle(root.path());
    std::fs::remove_file(bundle.join("rust_model.ot")).unwrap();
    assert!(ContextualWordAugmenter::from_bundle(&bundle, AugmentAction::Insert, Device::Cpu, 16, 1).is_err());
}

#[test]
fn test_folds_feed_training() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let root = tempdir()?;
    let bundle = common::write_tiny_bundle(&root.path().join("bundle"));
    let data = root.path().join("train.parquet");
    write_imbalanced_parquet(&data);
    let folds = root.path().join("folds");

    let config: AugmentationConfig = serde_yaml::from_str(&format!(
        "data_path: {}\noutput_dir: {}\naugmenter_model: {}\naugment_action: insert\n\
         device: cpu\nn_splits: 2\nrandom_seed: 5\nmax_length: 16\n",
        data.display(),
        folds.display(),
        bundle.display()
    ))?;
    let artifacts = pipeline::run_augmentation(&config)?;
    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts.iter().map(|a| a.subset_len).sum::<usize>(), 16);
    for fold in &artifacts {
        assert!(fold.subset_path.ends_with(format!("df{}.csv", fold.fold)));
        assert!(fold.balanced_path.is_file());

        let balanced = process_labels(DataReader::default().read(&fold.balanced_path, "label")?)?;
        assert_eq!(balanced.len(), fold.balanced_len);
        let counts = balanced.class_counts();
        if fold.skipped == 0 && counts.len() > 1 {
            assert_eq!(counts.values().min(), counts.values().max());
        }
    }

    let combined = DataReader::default().read_balanced_folds(&folds, "label")?;
    let expected: usize = artifacts.iter().map(|a| a.balanced_len).sum();
    assert_eq!(combined.records.len(), expected);

    common::write_quotes_csv(&root.path().join("val.csv"), "label", &[1, 1, 1, 1, 1, 1, 1, 1]);
    let pipeline_config = PipelineConfig::from_file(common::write_pipeline_config(root.path(), &bundle, &folds, 1))?;
    let tokenizer = load_tokenizer(&pipeline_config.loader.tokenizer_model)?;
    let loader = create_data_loader(&folds, &pipeline_config.loader, &tokenizer, true, 8)?;
    assert_eq!(loader.num_examples(), expected);
    Ok(())
}
