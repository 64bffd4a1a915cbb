//! The climate claim taxonomy and label parsing.

use crate::error::{PipelineError, Result};

pub const NUM_CLASSES: usize = 8;

/// Class names indexed by numeric label.
pub const LABEL_NAMES: [&str; NUM_CLASSES] = [
    "0_not_relevant",
    "1_not_happening",
    "2_not_human",
    "3_not_bad",
    "4_solutions_harmful_unnecessary",
    "5_science_unreliable",
    "6_proponents_biased",
    "7_fossil_fuels_needed",
];

/// A label as read from a data file, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelValue {
    Integer(i64),
    Text(String),
}

impl LabelValue {
    /// Returns the numeric label. Text labels are either an integer (a
    /// whole float like `"3.0"` counts) or `<digit>_<description>`, in which
    /// case the leading integer is used.
    pub fn to_numeric(&self) -> Result<i64> {
        match self {
            LabelValue::Integer(value) => Ok(*value),
            LabelValue::Text(text) => {
                let trimmed = text.trim();
                if let Ok(value) = trimmed.parse::<i64>() {
                    return Ok(value);
                }
                // Integer columns with gaps are often written as floats ("3.0").
                if let Ok(value) = trimmed.parse::<f64>() {
                    if value.is_finite() && value.fract() == 0.0 {
                        return Ok(value as i64);
                    }
                }
                trimmed
                    .split_once('_')
                    .and_then(|(prefix, _)| prefix.parse::<i64>().ok())
                    .ok_or_else(|| PipelineError::InvalidLabel { value: text.clone() })
            }
        }
    }
}

pub fn label_name(label: i64) -> Option<&'static str> {
    usize::try_from(label).ok().and_then(|i| LABEL_NAMES.get(i).copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_labels() {
        let value = LabelValue::Text("1_not_happening".into());
        assert_eq!(value.to_numeric().unwrap(), 1);
        let value = LabelValue::Text("5_science_unreliable".into());
        assert_eq!(value.to_numeric().unwrap(), 5);
    }

    #[test]
    fn test_numeric_labels_pass_through() {
        assert_eq!(LabelValue::Integer(3).to_numeric().unwrap(), 3);
        assert_eq!(LabelValue::Text("7".into()).to_numeric().unwrap(), 7);
    }

    #[test]
    fn test_whole_float_text_labels() {
        assert_eq!(LabelValue::Text("3.0".into()).to_numeric().unwrap(), 3);
        assert!(LabelValue::Text("3.5".into()).to_numeric().is_err());
        assert!(LabelValue::Text("NaN".into()).to_numeric().is_err());
    }

    #[test]
    fn test_invalid_label() {
        let err = LabelValue::Text("not_happening".into()).to_numeric().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidLabel { ref value } if value == "not_happening"));
        assert!(LabelValue::Text(String::new()).to_numeric().is_err());
    }

    #[test]
    fn test_label_names_match_prefixes() {
        for (i, name) in LABEL_NAMES.iter().enumerate() {
            let parsed = LabelValue::Text(name.to_string()).to_numeric().unwrap();
            assert_eq!(parsed, i as i64);
            assert_eq!(label_name(parsed), Some(*name));
        }
        assert_eq!(label_name(8), None);
        assert_eq!(label_name(-1), None);
    }
}
