use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::error::ArrowError;
use log::{debug, info};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use super::labels::LabelValue;
use crate::error::{PipelineError, Result};

/// A text/label pair as read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub text: String,
    pub label: LabelValue,
}

#[derive(Debug, Clone)]
pub struct RawDataset {
    pub path: PathBuf,
    pub text_column: String,
    pub label_column: String,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRecord {
    pub text: String,
    pub numeric_label: i64,
}

/// Records with normalized integer labels, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabeledDataset {
    pub text_column: String,
    pub label_column: String,
    pub records: Vec<LabeledRecord>,
}

impl LabeledDataset {
    pub fn new(text_column: &str, label_column: &str, records: Vec<LabeledRecord>) -> Self {
        Self {
            text_column: text_column.to_string(),
            label_column: label_column.to_string(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn texts(&self) -> Vec<String> {
        self.records.iter().map(|r| r.text.clone()).collect()
    }

    pub fn labels(&self) -> Vec<i64> {
        self.records.iter().map(|r| r.numeric_label).collect()
    }

    /// Number of records per label, ordered by label.
    pub fn class_counts(&self) -> BTreeMap<i64, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.numeric_label).or_insert(0) += 1;
        }
        counts
    }

    /// A new dataset holding the records at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            text_column: self.text_column.clone(),
            label_column: self.label_column.clone(),
            records: indices.iter().filter_map(|&i| self.records.get(i).cloned()).collect(),
        }
    }

    pub fn check_label_range(&self, num_labels: usize) -> Result<()> {
        let bound = num_labels as i64;
        match self.records.iter().find(|r| r.numeric_label < 0 || r.numeric_label >= bound) {
            Some(record) => Err(PipelineError::LabelOutOfRange {
                label: record.numeric_label,
                num_labels: bound,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Csv,
    Parquet,
}

fn detect_format(path: &Path) -> Result<FileFormat> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("csv") => Ok(FileFormat::Csv),
        Some("parquet") => Ok(FileFormat::Parquet),
        _ => Err(PipelineError::UnsupportedFormat { path: path.to_path_buf() }),
    }
}

/// Reads text/label tables from CSV or Parquet files.
#[derive(Debug, Clone)]
pub struct DataReader {
    text_column: String,
}

impl Default for DataReader {
    fn default() -> Self {
        Self { text_column: "quote".to_string() }
    }
}

impl DataReader {
    pub fn with_text_column(text_column: &str) -> Self {
        Self { text_column: text_column.to_string() }
    }

    /// Reads every row's text and label column. The format is chosen by
    /// file extension.
    pub fn read<P: AsRef<Path>>(&self, path: P, label_column: &str) -> Result<RawDataset> {
        let path = path.as_ref();
        let records = match detect_format(path)? {
            FileFormat::Csv => self.read_csv(path, label_column)?,
            FileFormat::Parquet => self.read_parquet(path, label_column)?,
        };
        info!("Read {} records from {:?}", records.len(), path);
        Ok(RawDataset {
            path: path.to_path_buf(),
            text_column: self.text_column.clone(),
            label_column: label_column.to_string(),
            records,
        })
    }

    /// Reads and concatenates the `df_balanced{i}.csv` files the K-fold
    /// augmentation writes to `dir`, in fold order.
    pub fn read_balanced_folds<P: AsRef<Path>>(&self, dir: P, label_column: &str) -> Result<RawDataset> {
        let dir = dir.as_ref();
        let mut folds: Vec<(usize, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter_map(|path| {
                let fold = path
                    .file_name()?
                    .to_str()?
                    .strip_prefix("df_balanced")?
                    .strip_suffix(".csv")?
                    .parse()
                    .ok()?;
                Some((fold, path))
            })
            .collect();
        if folds.is_empty() {
            return Err(PipelineError::UnsupportedFormat { path: dir.to_path_buf() });
        }
        folds.sort();

        let mut records = Vec::new();
        for (_, path) in &folds {
            records.extend(self.read(path, label_column)?.records);
        }
        debug!("Combined {} balanced folds from {:?}", folds.len(), dir);
        Ok(RawDataset {
            path: dir.to_path_buf(),
            text_column: self.text_column.clone(),
            label_column: label_column.to_string(),
            records,
        })
    }

    fn read_csv(&self, path: &Path, label_column: &str) -> Result<Vec<RawRecord>> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let column_index = |column: &str| {
            headers
                .iter()
                .position(|h| h == column)
                .ok_or_else(|| PipelineError::MissingColumn {
                    column: column.to_string(),
                    path: path.to_path_buf(),
                })
        };
        let text_idx = column_index(&self.text_column)?;
        let label_idx = column_index(label_column)?;

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            records.push(RawRecord {
                text: row.get(text_idx).unwrap_or_default().to_string(),
                label: LabelValue::Text(row.get(label_idx).unwrap_or_default().to_string()),
            });
        }
        Ok(records)
    }

    fn read_parquet(&self, path: &Path, label_column: &str) -> Result<Vec<RawRecord>> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        let schema = builder.schema().clone();
        let column_index = |column: &str| {
            schema.index_of(column).map_err(|_| PipelineError::MissingColumn {
                column: column.to_string(),
                path: path.to_path_buf(),
            })
        };
        let text_idx = column_index(&self.text_column)?;
        let label_idx = column_index(label_column)?;
        let label_type = schema.field(label_idx).data_type();
        let integer_labels = label_type.is_integer();
        let float_labels = label_type.is_floating();
        debug!("Parquet label column '{}' has type {}", label_column, label_type);

        let mut records = Vec::new();
        for batch in builder.build()? {
            let batch = batch?;
            let texts = cast(batch.column(text_idx), &DataType::Utf8)?;
            let texts = downcast::<StringArray>(texts.as_ref(), &self.text_column)?;

            let labels: Vec<LabelValue> = if integer_labels {
                let values = cast(batch.column(label_idx), &DataType::Int64)?;
                let values = downcast::<Int64Array>(values.as_ref(), label_column)?;
                (0..values.len())
                    .map(|i| {
                        if values.is_null(i) {
                            LabelValue::Text(String::new())
                        } else {
                            LabelValue::Integer(values.value(i))
                        }
                    })
                    .collect()
            } else if float_labels {
                let values = cast(batch.column(label_idx), &DataType::Float64)?;
                let values = downcast::<Float64Array>(values.as_ref(), label_column)?;
                (0..values.len())
                    .map(|i| {
                        if values.is_null(i) {
                            return LabelValue::Text(String::new());
                        }
                        let value = values.value(i);
                        if value.is_finite() && value.fract() == 0.0 {
                            LabelValue::Integer(value as i64)
                        } else {
                            LabelValue::Text(value.to_string())
                        }
                    })
                    .collect()
            } else {
                let values = cast(batch.column(label_idx), &DataType::Utf8)?;
                let values = downcast::<StringArray>(values.as_ref(), label_column)?;
                (0..values.len())
                    .map(|i| {
                        let text = if values.is_null(i) { "" } else { values.value(i) };
                        LabelValue::Text(text.to_string())
                    })
                    .collect()
            };

            for (i, label) in labels.into_iter().enumerate() {
                let text = if texts.is_null(i) { "" } else { texts.value(i) };
                records.push(RawRecord { text: text.to_string(), label });
            }
        }
        Ok(records)
    }
}

fn downcast<'a, T: 'static>(array: &'a dyn Array, column: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| {
            PipelineError::Arrow(ArrowError::CastError(format!(
                "unexpected array type for column '{}'",
                column
            )))
        })
}

/// Normalizes labels to integers. Compound labels (`"3_not_bad"`) become
/// their leading integer; integer labels are kept.
pub fn process_labels(raw: RawDataset) -> Result<LabeledDataset> {
    let records = raw
        .records
        .into_iter()
        .map(|record| {
            Ok(LabeledRecord {
                numeric_label: record.label.to_numeric()?,
                text: record.text,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LabeledDataset {
        text_column: raw.text_column,
        label_column: raw.label_column,
        records,
    })
}

/// Reads a held-out test file with `quote` and `numeric_label` columns.
pub fn load_test_data<P: AsRef<Path>>(path: P) -> Result<LabeledDataset> {
    process_labels(DataReader::default().read(path, "numeric_label")?)
}

/// Writes `text_column,label_column` rows with numeric labels.
pub fn write_labeled_csv<P: AsRef<Path>>(dataset: &LabeledDataset, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([dataset.text_column.as_str(), dataset.label_column.as_str()])?;
    for record in &dataset.records {
        writer.write_record([record.text.as_str(), record.numeric_label.to_string().as_str()])?;
    }
    writer.flush()?;
    Ok(())
}
