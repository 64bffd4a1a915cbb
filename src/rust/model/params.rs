use std::collections::BTreeMap;

const LAYER_PREFIX: &str = "distilbert.transformer.layer.";
const HEAD_PREFIXES: [&str; 2] = ["pre_classifier.", "classifier."];

/// Partition of named parameters into frozen and trainable groups.
///
/// The optimizer is built from [`ParameterGroups::trainable`] only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterGroups {
    pub frozen: Vec<String>,
    /// Trainable encoder parameters keyed by layer index.
    pub trainable_encoder: BTreeMap<usize, Vec<String>>,
    pub head: Vec<String>,
}

impl ParameterGroups {
    /// Names of every parameter that receives updates.
    pub fn trainable(&self) -> Vec<&str> {
        self.trainable_encoder
            .values()
            .flatten()
            .chain(&self.head)
            .map(String::as_str)
            .collect()
    }

    pub fn trainable_layers(&self) -> Vec<usize> {
        self.trainable_encoder.keys().copied().collect()
    }

    pub fn is_trainable(&self, name: &str) -> bool {
        self.head.iter().any(|n| n == name)
            || self.trainable_encoder.values().flatten().any(|n| n == name)
    }
}

fn encoder_layer(name: &str) -> Option<usize> {
    let rest = name.strip_prefix(LAYER_PREFIX)?;
    rest.split('.').next()?.parse().ok()
}

/// Splits parameter names so that the last `num_trainable_layers` encoder
/// layers (indices `total_layers - num_trainable_layers ..total_layers`)
/// and the classification head are trainable. Everything else, including
/// embeddings, is frozen.
pub fn partition_parameters<'a, I>(names: I, total_layers: usize, num_trainable_layers: usize) -> ParameterGroups
where
    I: IntoIterator<Item = &'a str>,
{
    let first_trainable = total_layers.saturating_sub(num_trainable_layers);
    let mut groups = ParameterGroups::default();
    let mut names: Vec<&str> = names.into_iter().collect();
    names.sort_unstable();

    for name in names {
        if HEAD_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            groups.head.push(name.to_string());
            continue;
        }
        match encoder_layer(name) {
            Some(layer) if layer >= first_trainable && layer < total_layers => {
                groups
                    .trainable_encoder
                    .entry(layer)
                    .or_default()
                    .push(name.to_string());
            }
            _ => groups.frozen.push(name.to_string()),
        }
    }
    groups
}
