use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::PipelineError;
use crate::models::{BuiltinModel, BundleFile};

/// Architecture file of a pretrained bundle.
pub const CONFIG_FILE: &str = "config.json";
/// Weights file of a pretrained bundle, in libtorch VarStore format.
pub const WEIGHTS_FILE: &str = "rust_model.ot";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// SHA-256 of every bundle file, recorded when the bundle is downloaded.
pub const CHECKSUMS_FILE: &str = "checksums.json";

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model not downloaded: {0} (run the download command first)")]
    NotDownloaded(String),
    #[error("Unknown model '{0}': not a directory and not a built-in model")]
    UnknownModel(String),
    #[error("Download error: {0}")]
    DownloadError(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Model verification failed")]
    VerificationFailed,
    #[error("Checksum record error: {0}")]
    Checksums(#[from] serde_json::Error),
    #[error("Hash mismatch: expected {expected}, got {actual} for {file} file")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },
}

/// Caches pretrained bundles on disk and downloads missing ones.
#[derive(Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
    download_lock: Arc<Mutex<()>>,
}

impl ModelManager {
    /// Creates a new ModelManager with the default models directory
    pub fn new_default() -> io::Result<Self> {
        Self::new(Self::get_default_models_dir())
    }

    /// Returns the default models directory path
    pub fn get_default_models_dir() -> PathBuf {
        // 1. Check environment variable
        if let Ok(path) = env::var("CLIMATE_DEBUNK_CACHE") {
            return PathBuf::from(path).join("models");
        }

        // 2. Use platform-specific cache directory
        if let Some(cache_dir) = dirs::cache_dir() {
            return cache_dir.join("climate-debunk").join("models");
        }

        // 3. Fallback to user's home directory
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(".cache").join("climate-debunk").join("models");
        }

        // 4. If all else fails, use system temp directory
        env::temp_dir().join("climate-debunk").join("models")
    }

    pub fn new<P: AsRef<Path>>(models_dir: P) -> io::Result<Self> {
        let models_dir = models_dir.as_ref().to_path_buf();
        fs::create_dir_all(&models_dir)?;
        Ok(Self {
            models_dir,
            download_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn bundle_dir(&self, model: BuiltinModel) -> PathBuf {
        self.models_dir.join(model.name())
    }

    pub fn file_path(&self, model: BuiltinModel, file: &str) -> PathBuf {
        self.bundle_dir(model).join(file)
    }

    pub fn is_model_downloaded(&self, model: BuiltinModel) -> bool {
        let info = model.get_model_info();
        info.files.iter().all(|file| {
            let path = self.file_path(model, file.name);
            log::debug!("  {:?} (exists: {})", path, path.exists());
            path.exists()
        })
    }

    pub async fn download_model(&self, model: BuiltinModel) -> Result<(), ModelError> {
        let info = model.get_model_info();
        let _lock = self.download_lock.lock().await;

        let model_dir = self.bundle_dir(model);
        log::info!("Creating model directory at {:?}", model_dir);
        fs::create_dir_all(&model_dir)?;
        let recorded = self.recorded_checksums(model).unwrap_or_default();

        for file in &info.files {
            let path = self.file_path(model, file.name);
            let expected = expected_hash(file, &recorded);
            let result = if path.exists() && self.verify_file(&path, expected)? {
                log::info!("Existing {} verified successfully", file.name);
                Ok(())
            } else {
                log::info!("Downloading {}...", file.name);
                self.download_and_verify_file(file, &path).await
            };

            if let Err(e) = result {
                log::error!("Failed to set up {}: {}", file.name, e);
                // Cleanup on failure
                let _ = self.remove_download(model);
                return Err(e);
            }
        }

        self.record_checksums(model)?;
        log::info!("Model {} ready to use", info.name);
        Ok(())
    }

    /// Checksums written by the last successful download, keyed by file name.
    /// Empty when nothing was recorded.
    pub fn recorded_checksums(&self, model: BuiltinModel) -> Result<BTreeMap<String, String>, ModelError> {
        let path = self.file_path(model, CHECKSUMS_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Hashes every bundle file on disk and records the result, so later
    /// verification detects corrupted or replaced files.
    pub fn record_checksums(&self, model: BuiltinModel) -> Result<(), ModelError> {
        let mut checksums = BTreeMap::new();
        for file in model.get_model_info().files {
            let bytes = fs::read(self.file_path(model, file.name))?;
            checksums.insert(file.name.to_string(), sha256_hex(&bytes));
        }
        let path = self.file_path(model, CHECKSUMS_FILE);
        fs::write(&path, serde_json::to_string_pretty(&checksums)?)?;
        log::debug!("Recorded checksums in {:?}", path);
        Ok(())
    }

    fn verify_file(&self, path: &Path, expected_hash: Option<&str>) -> Result<bool, ModelError> {
        let Some(expected_hash) = expected_hash else {
            return Ok(path.exists());
        };
        log::info!("Verifying file: {:?}", path);
        let bytes = fs::read(path)?;
        let hash = sha256_hex(&bytes);
        log::debug!("Calculated hash: {}", hash);
        log::debug!("Expected hash:   {}", expected_hash);
        Ok(hash == expected_hash)
    }

    /// Checks every file against its pinned hash, or else the hash recorded
    /// at download time. A file with neither only needs to exist.
    pub fn verify_model(&self, model: BuiltinModel) -> Result<bool, ModelError> {
        let info = model.get_model_info();
        let recorded = match self.recorded_checksums(model) {
            Ok(recorded) => recorded,
            Err(e) => {
                log::warn!("Unreadable checksum record for {}: {}", model.name(), e);
                return Ok(false);
            }
        };
        for file in &info.files {
            let path = self.file_path(model, file.name);
            if !path.exists() || !self.verify_file(&path, expected_hash(file, &recorded))? {
                log::info!("Verification failed for {:?}", path);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn download_and_verify_file(&self, file: &BundleFile, path: &Path) -> Result<(), ModelError> {
        log::info!("Downloading {} from {} to {:?}", file.name, file.url, path);
        let response = reqwest::get(&file.url).await?.error_for_status()?;
        log::info!("Download response status: {}", response.status());
        let bytes = response.bytes().await?;
        log::info!("Downloaded {} bytes", bytes.len());

        if let Some(expected) = file.sha256 {
            let hash = sha256_hex(&bytes);
            if hash != expected {
                log::error!("{} hash mismatch: expected {}, got {}", file.name, expected, hash);
                return Err(ModelError::HashMismatch {
                    file: file.name.to_string(),
                    expected: expected.to_string(),
                    actual: hash,
                });
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &bytes)?;

        if !self.verify_file(path, file.sha256)? {
            return Err(ModelError::VerificationFailed);
        }
        log::info!("{} downloaded successfully", file.name);
        Ok(())
    }

    pub fn remove_download(&self, model: BuiltinModel) -> Result<(), ModelError> {
        let names = model.get_model_info().files.into_iter().map(|file| file.name);
        for name in names.chain([CHECKSUMS_FILE]) {
            let path = self.file_path(model, name);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Ensures that a model is downloaded and verified.
    /// If the model doesn't exist, it will be downloaded.
    /// If verification fails, it will be re-downloaded.
    pub async fn ensure_model_downloaded(&self, model: BuiltinModel) -> Result<(), ModelError> {
        if !self.is_model_downloaded(model) {
            log::info!("Model {} not found, downloading...", model.name());
            self.download_model(model).await?;
        } else if !self.verify_model(model)? {
            log::info!("Model verification failed, re-downloading...");
            self.remove_download(model)?;
            self.download_model(model).await?;
        }
        Ok(())
    }
}

fn expected_hash<'a>(file: &BundleFile, recorded: &'a BTreeMap<String, String>) -> Option<&'a str> {
    file.sha256.or_else(|| recorded.get(file.name).map(String::as_str))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Resolves a model name to a bundle directory: either an existing local
/// directory or a built-in model already present in the cache.
pub fn resolve_bundle_dir(spec: &str) -> Result<PathBuf, PipelineError> {
    let local = Path::new(spec);
    if local.is_dir() {
        return Ok(local.to_path_buf());
    }
    let model = BuiltinModel::from_name(spec).ok_or_else(|| ModelError::UnknownModel(spec.to_string()))?;
    let manager = ModelManager::new_default()?;
    if !manager.is_model_downloaded(model) {
        return Err(ModelError::NotDownloaded(spec.to_string()).into());
    }
    Ok(manager.bundle_dir(model))
}

/// Resolves `spec` to a file: `spec` itself when it is a file, otherwise
/// `file` inside the bundle directory `spec` names.
pub fn resolve_bundle_file(spec: &str, file: &str) -> Result<PathBuf, PipelineError> {
    let local = Path::new(spec);
    if local.is_file() {
        return Ok(local.to_path_buf());
    }
    Ok(resolve_bundle_dir(spec)?.join(file))
}
