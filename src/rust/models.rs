/// One file of a pretrained bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub name: &'static str,
    pub url: String,
    /// Expected SHA-256 in lowercase hex, when pinned.
    pub sha256: Option<&'static str>,
}

/// Download information for a built-in pretrained model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub files: Vec<BundleFile>,
}

/// Pretrained models the pipeline can fetch by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinModel {
    /// Six-layer uncased DistilBERT with its masked-LM head.
    DistilBertBaseUncased,
}

const HF_BASE: &str = "https://huggingface.co";

impl BuiltinModel {
    pub const ALL: [BuiltinModel; 1] = [BuiltinModel::DistilBertBaseUncased];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinModel::DistilBertBaseUncased => "distilbert-base-uncased",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    pub fn get_model_info(&self) -> ModelInfo {
        let repo = self.name();
        let file = |name: &'static str| BundleFile {
            name,
            url: format!("{}/{}/resolve/main/{}", HF_BASE, repo, name),
            sha256: None,
        };
        ModelInfo {
            name: repo.to_string(),
            files: vec![file("config.json"), file("rust_model.ot"), file("tokenizer.json")],
        }
    }
}
