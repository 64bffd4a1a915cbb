use std::fs;

use climate_debunk::{BuiltinModel, ModelManager};
use tempfile::tempdir;

#[test]
fn test_ensure_skips_present_bundle() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let manager = ModelManager::new(dir.path())?;
    let model = BuiltinModel::DistilBertBaseUncased;

    fs::create_dir_all(manager.bundle_dir(model))?;
    for file in model.get_model_info().files {
        fs::write(manager.file_path(model, file.name), b"{}")?;
    }

    // Every file is present with no pinned or recorded hash, so nothing is fetched.
    tokio_test::block_on(manager.ensure_model_downloaded(model))?;
    assert!(manager.is_model_downloaded(model));
    assert_eq!(fs::read(manager.file_path(model, "config.json"))?, b"{}");
    Ok(())
}

#[tokio::test]
async fn test_partial_bundle_is_not_downloaded() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let manager = ModelManager::new(dir.path())?;
    let model = BuiltinModel::DistilBertBaseUncased;

    fs::create_dir_all(manager.bundle_dir(model))?;
    fs::write(manager.file_path(model, "tokenizer.json"), b"{}")?;
    assert!(!manager.is_model_downloaded(model));
    assert!(!manager.verify_model(model)?);

    manager.remove_download(model)?;
    assert!(!manager.file_path(model, "tokenizer.json").exists());
    Ok(())
}

#[tokio::test]
#[ignore = "downloads the full pretrained bundle"]
async fn test_model_download() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let manager = ModelManager::new(dir.path())?;
    let model = BuiltinModel::DistilBertBaseUncased;

    assert!(!manager.is_model_downloaded(model));
    manager.download_model(model).await?;
    assert!(manager.is_model_downloaded(model));
    assert!(manager.verify_model(model)?);
    Ok(())
}
