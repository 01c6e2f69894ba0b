use crate::detector::SMALL_RT_DETR_V2_MODEL_FILE_NAME;
use anyhow::{anyhow, bail};
use hf_hub::api::tokio::Api;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub enum Model {
    Model(String),
    AllRtDetr2,
    AllYolo5,
    All,
}

/// COCO trained exports, these know car, bus, truck and motorcycle.
pub const RT_DETR2_MODELS: (&str, &[&str]) = (
    "xnorpx/rt-detr2-onnx",
    &[
        "rt-detrv2-s.onnx",
        "rt-detrv2-s.yaml",
        "rt-detrv2-ms.onnx",
        "rt-detrv2-ms.yaml",
        "rt-detrv2-m.onnx",
        "rt-detrv2-m.yaml",
        "rt-detrv2-l.onnx",
        "rt-detrv2-l.yaml",
        "rt-detrv2-x.onnx",
        "rt-detrv2-x.yaml",
    ],
);

/// Camera trained yolo5 exports that include vehicle classes.
pub const YOLO5_MODELS: (&str, &[&str]) = (
    "xnorpx/blue-onyx-yolo5",
    &[
        "IPcam-combined.onnx",
        "IPcam-combined.yaml",
        "IPcam-general.onnx",
        "IPcam-general.yaml",
    ],
);

pub fn get_all_models() -> [(&'static str, &'static [&'static str]); 2] {
    [RT_DETR2_MODELS, YOLO5_MODELS]
}

pub fn get_all_model_names() -> Vec<String> {
    get_all_models()
        .iter()
        .flat_map(|(_, files)| files.iter())
        .filter(|file| file.ends_with(".onnx"))
        .map(|file| file.to_string())
        .collect()
}

pub fn list_models() {
    for model_name in get_all_model_names() {
        info!("{}", model_name);
    }
}

/// Class file shipped next to each model.
pub fn yaml_file_name(model_file_name: &str) -> String {
    match model_file_name.strip_suffix(".onnx") {
        Some(stem) => format!("{stem}.yaml"),
        None => format!("{model_file_name}.yaml"),
    }
}

/// Directory of the running binary, falling back to the working directory.
pub fn default_model_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub async fn download_model(model_path: PathBuf, model: Model) -> anyhow::Result<()> {
    if !model_path.exists() {
        fs::create_dir_all(&model_path).await?;
    }

    let mut downloaded_models: Vec<String> = Vec::new();

    match model {
        Model::Model(model_name) => {
            download_file_to_dir(&model_name, &model_path).await?;
            downloaded_models.push(model_name.clone());

            let yaml_name = yaml_file_name(&model_name);
            match download_file_to_dir(&yaml_name, &model_path).await {
                Ok(_) => downloaded_models.push(yaml_name),
                Err(e) => {
                    warn!("Failed to download YAML file {}: {}", yaml_name, e);
                    warn!("The model will still work but will use the COCO object classes");
                }
            }
        }
        Model::AllRtDetr2 => {
            download_repository_files(RT_DETR2_MODELS, &model_path, &mut downloaded_models).await?;
        }
        Model::AllYolo5 => {
            download_repository_files(YOLO5_MODELS, &model_path, &mut downloaded_models).await?;
        }
        Model::All => {
            for model_repo in get_all_models() {
                download_repository_files(model_repo, &model_path, &mut downloaded_models).await?;
            }
        }
    }

    info!("Successfully downloaded models: {:?}", downloaded_models);
    Ok(())
}

async fn download_repository_files(
    models: (&str, &[&str]),
    target_dir: &Path,
    downloaded_models: &mut Vec<String>,
) -> anyhow::Result<()> {
    let (repo_name, files) = models;
    let api = Api::new()?;
    let api_repo = api.model(repo_name.to_string());

    let mut errors = Vec::new();
    for filename in files.iter() {
        let result = match api_repo.get(filename).await {
            Ok(cached_file) => fs::copy(&cached_file, target_dir.join(filename))
                .await
                .map_err(|e| format!("Failed to copy {filename} to {}: {e}", target_dir.display())),
            Err(e) => Err(format!("Failed to download {filename} from {repo_name}: {e}")),
        };
        match result {
            Ok(_) => {
                info!("Downloaded {} to {}", filename, target_dir.display());
                downloaded_models.push(filename.to_string());
            }
            Err(error_msg) => {
                warn!("{}", error_msg);
                errors.push(error_msg);
            }
        }
    }

    if errors.len() == files.len() {
        bail!("Nothing could be downloaded from {repo_name}: {errors:?}");
    }
    if !errors.is_empty() {
        warn!("Some files failed to download but continuing: {:?}", errors);
    }
    Ok(())
}

/// Download a specific file from whichever repository lists it.
pub async fn download_file_to_dir(filename: &str, target_dir: &Path) -> anyhow::Result<()> {
    let (repo_name, _) = get_all_models()
        .into_iter()
        .find(|(_, files)| files.contains(&filename))
        .ok_or_else(|| anyhow!("File {} not found in any repository", filename))?;
    info!("Found {} in repository {}", filename, repo_name);

    if !target_dir.exists() {
        fs::create_dir_all(target_dir).await?;
    }

    let api = Api::new()?;
    let cached_file = api.model(repo_name.to_string()).get(filename).await?;
    let target_path = target_dir.join(filename);
    fs::copy(&cached_file, &target_path).await?;
    info!("Downloaded {} to {}", filename, target_path.display());
    Ok(())
}

/// Makes sure the default detector model is next to the binary, downloading it when missing.
/// A user supplied model path is only checked.
pub async fn ensure_default_model(model: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(model) = model {
        if !model.exists() {
            bail!("Model file {} does not exist", model.display());
        }
        return Ok(model.to_path_buf());
    }

    let model_dir = default_model_dir();
    let model_path = model_dir.join(SMALL_RT_DETR_V2_MODEL_FILE_NAME);
    if !model_path.exists() {
        info!("Model {} not found, downloading...", SMALL_RT_DETR_V2_MODEL_FILE_NAME);
        download_file_to_dir(SMALL_RT_DETR_V2_MODEL_FILE_NAME, &model_dir).await?;
    }
    Ok(model_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_names() {
        let names = get_all_model_names();
        assert!(names.contains(&SMALL_RT_DETR_V2_MODEL_FILE_NAME.to_string()));
        assert!(names.iter().all(|name| name.ends_with(".onnx")));
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn test_yaml_file_name() {
        assert_eq!(yaml_file_name("rt-detrv2-s.onnx"), "rt-detrv2-s.yaml");
        assert_eq!(yaml_file_name("custom"), "custom.yaml");
    }

    #[tokio::test]
    async fn test_unknown_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = download_file_to_dir("nope.onnx", dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("not found in any repository"));
    }

    #[tokio::test]
    async fn test_ensure_user_model_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.onnx");
        assert!(ensure_default_model(Some(&missing)).await.is_err());

        let present = dir.path().join("present.onnx");
        std::fs::write(&present, b"onnx").unwrap();
        assert_eq!(ensure_default_model(Some(&present)).await.unwrap(), present);
    }
}
