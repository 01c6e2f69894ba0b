//! Batch processing of file path lists and the JSON output file.

use crate::{
    api::{BatchEntry, BatchOutcome, BatchResult, ErrorResponse},
    pipeline::FusionEngine,
};
use anyhow::{Context, bail};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum BatchErrorPolicy {
    /// A failing entry is reported in place and the batch continues.
    #[default]
    PerEntry,
    /// Any missing file or failing entry replaces the whole result with one error object.
    FailFast,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    #[default]
    Overwrite,
    /// Replace entries with the same `filePath` in an existing output file.
    Merge,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum BatchResponse {
    Entries(Vec<BatchResult>),
    Failed(ErrorResponse),
}

impl BatchResponse {
    fn failed(error: impl Into<String>) -> Self {
        BatchResponse::Failed(ErrorResponse {
            error: error.into(),
        })
    }
}

/// Result keys a pass-through field must not shadow.
const RESERVED_KEYS: [&str; 3] = ["vehicles", "plates", "error"];

pub fn parse_entries(data: &[u8]) -> anyhow::Result<Vec<BatchEntry>> {
    let mut entries: Vec<BatchEntry> = serde_json::from_slice(data)
        .context("Expected a JSON array of objects with a filePath")?;
    for entry in &mut entries {
        for key in RESERVED_KEYS {
            if entry.extra.remove(key).is_some() {
                warn!(file_path = %entry.file_path, key, "Dropping reserved key from batch entry");
            }
        }
    }
    Ok(entries)
}

fn file_not_found(path: &str) -> String {
    format!("File not found: {path}")
}

async fn file_exists(path: &str) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn process_entry(engine: &FusionEngine, entry: BatchEntry) -> BatchResult {
    let outcome = if !file_exists(&entry.file_path).await {
        BatchOutcome::Failed {
            error: file_not_found(&entry.file_path),
        }
    } else {
        match engine.process_file(Path::new(&entry.file_path)).await {
            Ok(bundle) => BatchOutcome::Processed(bundle),
            Err(err) => {
                warn!(
                    file_path = %entry.file_path,
                    error = %format!("{err:#}"),
                    "Batch entry failed"
                );
                BatchOutcome::Failed {
                    error: format!("{err:#}"),
                }
            }
        }
    };
    BatchResult { entry, outcome }
}

/// Processes `entries` with up to `concurrency` images in flight. Results keep input order.
pub async fn run_batch(
    engine: &FusionEngine,
    entries: Vec<BatchEntry>,
    policy: BatchErrorPolicy,
    concurrency: usize,
) -> BatchResponse {
    info!(entries = entries.len(), ?policy, concurrency, "Starting batch");

    if policy == BatchErrorPolicy::FailFast {
        for entry in &entries {
            if !file_exists(&entry.file_path).await {
                warn!(file_path = %entry.file_path, "Batch aborted, file not found");
                return BatchResponse::failed(file_not_found(&entry.file_path));
            }
        }
    }

    // More images in flight than the detector queue holds would be rejected
    let in_flight = concurrency.clamp(1, engine.detector_capacity().max(1));
    if in_flight < concurrency {
        debug!(concurrency, in_flight, "Batch concurrency limited to the detector queue size");
    }

    let mut results = Vec::with_capacity(entries.len());
    let mut processed = stream::iter(entries)
        .map(|entry| process_entry(engine, entry))
        .buffered(in_flight);

    while let Some(result) = processed.next().await {
        if let (BatchErrorPolicy::FailFast, BatchOutcome::Failed { error }) =
            (policy, &result.outcome)
        {
            return BatchResponse::failed(error.clone());
        }
        debug!(
            file_path = %result.entry.file_path,
            error = result.is_error(),
            "Batch entry done"
        );
        results.push(result);
    }

    info!(
        processed = results.len(),
        failed = results.iter().filter(|r| r.is_error()).count(),
        "Batch complete"
    );
    BatchResponse::Entries(results)
}

/// Writes the batch response as pretty JSON.
///
/// In [`OutputMode::Merge`] an existing array is updated in place, keyed by
/// `filePath`. A fail-fast error object is never merged; the file is left
/// untouched and the error is returned.
pub fn write_results(
    path: &Path,
    response: &BatchResponse,
    mode: OutputMode,
) -> anyhow::Result<()> {
    let output = match (mode, response) {
        (OutputMode::Overwrite, response) => serde_json::to_value(response)?,
        (OutputMode::Merge, BatchResponse::Failed(ErrorResponse { error })) => {
            bail!("Batch failed, {} left unchanged: {error}", path.display())
        }
        (OutputMode::Merge, BatchResponse::Entries(results)) => {
            let mut merged = read_existing(path)?;
            for result in results {
                let value = serde_json::to_value(result)?;
                match merged
                    .iter_mut()
                    .find(|existing| existing.get("filePath") == value.get("filePath"))
                {
                    Some(existing) => *existing = value,
                    None => merged.push(value),
                }
            }
            Value::Array(merged)
        }
    };

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, serde_json::to_vec_pretty(&output)?)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    info!(output = %path.display(), ?mode, "Results written");
    Ok(())
}

fn read_existing(path: &Path) -> anyhow::Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    match serde_json::from_slice(&data)? {
        Value::Array(existing) => Ok(existing),
        _ => bail!("{} does not hold a JSON array, refusing to merge", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{DetectedVehicle, PlateCandidate},
        detector::VehicleDetector,
        image::{Image, encode_jpeg},
        pipeline::FusionConfig,
        recognizer::PlateRecognizer,
        worker::DetectorWorker,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::{path::PathBuf, sync::Arc, time::Duration};

    struct NoVehicles;

    impl VehicleDetector for NoVehicles {
        fn process_frame(
            &mut self,
            _image: &Image,
            _timestamp: DateTime<Utc>,
        ) -> anyhow::Result<Vec<DetectedVehicle>> {
            Ok(Vec::new())
        }

        fn model_name(&self) -> &str {
            "none"
        }
    }

    /// Reads the image name back as plate text. Names starting with `slow` take longer.
    struct EchoRecognizer;

    #[async_trait]
    impl PlateRecognizer for EchoRecognizer {
        async fn run(&self, images: &[Image]) -> anyhow::Result<Vec<Vec<PlateCandidate>>> {
            let mut out = Vec::new();
            for image in images {
                let name = image.name.clone().unwrap_or_default();
                if name.contains("broken") {
                    anyhow::bail!("recognizer exploded");
                }
                if name.contains("slow") {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                }
                out.push(vec![PlateCandidate::new(None, Some(0.5), Some(name), Some(0.5))]);
            }
            Ok(out)
        }
    }

    fn engine() -> FusionEngine {
        let (handle, worker) = DetectorWorker::from_detector(Box::new(NoVehicles), Some(8));
        worker.spawn_worker_thread();
        FusionEngine::new(handle, Arc::new(EchoRecognizer), FusionConfig::default())
    }

    fn write_jpeg(dir: &Path, name: &str) -> String {
        let image = Image::new(None, 8, 8, vec![128; 8 * 8 * 3]).unwrap();
        let path: PathBuf = dir.join(name);
        std::fs::write(&path, encode_jpeg(&image, 90).unwrap()).unwrap();
        path.to_string_lossy().to_string()
    }

    fn entry(path: &str) -> BatchEntry {
        BatchEntry {
            file_path: path.to_string(),
            doc_name: Some("doc".to_string()),
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_jpeg(dir.path(), "a.jpg");
        let c = write_jpeg(dir.path(), "c.jpg");
        let missing = dir.path().join("b.jpg").to_string_lossy().to_string();

        let response = run_batch(
            &engine(),
            vec![entry(&a), entry(&missing), entry(&c)],
            BatchErrorPolicy::PerEntry,
            1,
        )
        .await;
        let BatchResponse::Entries(results) = response else {
            panic!("expected entries");
        };
        assert_eq!(results.len(), 3);
        assert!(!results[0].is_error());
        assert_eq!(
            results[1].outcome,
            BatchOutcome::Failed {
                error: format!("File not found: {missing}")
            }
        );
        assert!(!results[2].is_error());
        assert_eq!(results[2].entry.doc_name.as_deref(), Some("doc"));
    }

    #[tokio::test]
    async fn test_missing_file_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_jpeg(dir.path(), "a.jpg");
        let missing = dir.path().join("b.jpg").to_string_lossy().to_string();

        let response = run_batch(
            &engine(),
            vec![entry(&a), entry(&missing), entry(&a)],
            BatchErrorPolicy::FailFast,
            1,
        )
        .await;
        assert_eq!(
            response,
            BatchResponse::Failed(ErrorResponse {
                error: format!("File not found: {missing}")
            })
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({"error": format!("File not found: {missing}")}));
    }

    #[tokio::test]
    async fn test_processing_error_policies() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_jpeg(dir.path(), "good.jpg");
        let broken = write_jpeg(dir.path(), "broken.jpg");
        let entries = vec![entry(&good), entry(&broken)];

        let BatchResponse::Entries(results) =
            run_batch(&engine(), entries.clone(), BatchErrorPolicy::PerEntry, 1).await
        else {
            panic!("expected entries");
        };
        assert!(results[1].is_error());

        let response = run_batch(&engine(), entries, BatchErrorPolicy::FailFast, 1).await;
        let BatchResponse::Failed(ErrorResponse { error }) = response else {
            panic!("expected error object");
        };
        assert!(error.contains("recognizer exploded"));
    }

    #[tokio::test]
    async fn test_concurrent_batch_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = [
            write_jpeg(dir.path(), "slow_1.jpg"),
            write_jpeg(dir.path(), "fast_2.jpg"),
            write_jpeg(dir.path(), "slow_3.jpg"),
            write_jpeg(dir.path(), "fast_4.jpg"),
        ];
        let entries = paths.iter().map(|p| entry(p)).collect();

        let BatchResponse::Entries(results) =
            run_batch(&engine(), entries, BatchErrorPolicy::PerEntry, 4).await
        else {
            panic!("expected entries");
        };
        let order: Vec<_> = results.iter().map(|r| r.entry.file_path.clone()).collect();
        assert_eq!(order, paths.to_vec());
        for (result, path) in results.iter().zip(&paths) {
            let BatchOutcome::Processed(bundle) = &result.outcome else {
                panic!("expected processed entry");
            };
            assert_eq!(&bundle.plates[0].recognition_text, path);
        }
    }

    #[test]
    fn test_merge_replaces_same_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.json");
        let existing = serde_json::json!([
            {"filePath": "a.jpg", "error": "old"},
            {"filePath": "keep.jpg", "vehicles": [], "plates": []},
        ]);
        std::fs::write(&output, existing.to_string()).unwrap();

        let response = BatchResponse::Entries(vec![
            BatchResult {
                entry: entry("a.jpg"),
                outcome: BatchOutcome::Processed(Default::default()),
            },
            BatchResult {
                entry: entry("new.jpg"),
                outcome: BatchOutcome::Failed {
                    error: "File not found: new.jpg".to_string(),
                },
            },
        ]);
        write_results(&output, &response, OutputMode::Merge).unwrap();

        let merged: Vec<Value> =
            serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0]["filePath"], "a.jpg");
        assert!(merged[0].get("error").is_none());
        assert_eq!(merged[0]["vehicles"], serde_json::json!([]));
        assert_eq!(merged[1]["filePath"], "keep.jpg");
        assert_eq!(merged[2]["filePath"], "new.jpg");
    }

    #[test]
    fn test_overwrite_and_merge_error_object() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.json");
        std::fs::write(&output, "[]").unwrap();

        let failed = BatchResponse::failed("File not found: x.jpg");
        assert!(write_results(&output, &failed, OutputMode::Merge).is_err());
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "[]");

        write_results(&output, &failed, OutputMode::Overwrite).unwrap();
        let written: Value = serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
        assert_eq!(written["error"], "File not found: x.jpg");
    }

    #[test]
    fn test_parse_entries() {
        let entries =
            parse_entries(br#"[{"filePath": "a.jpg", "DocName": "d", "x": 1}]"#).unwrap();
        assert_eq!(entries[0].file_path, "a.jpg");
        assert!(parse_entries(br#"{"filePath": "a.jpg"}"#).is_err());
    }

    #[test]
    fn test_parse_entries_drops_result_keys() {
        let entries = parse_entries(
            br#"[{"filePath": "a.jpg", "error": "stale", "plates": [1], "vehicles": 2, "x": 1}]"#,
        )
        .unwrap();
        assert_eq!(entries[0].extra.len(), 1);
        assert_eq!(entries[0].extra["x"], 1);

        let result = BatchResult {
            entry: entries[0].clone(),
            outcome: BatchOutcome::Processed(Default::default()),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json.matches("\"plates\"").count(), 1);
        assert!(!json.contains("\"error\""));
        let parsed: BatchResult = serde_json::from_str(&json).unwrap();
        assert!(!parsed.is_error());
    }

    /// Detector that takes a while per frame, so requests pile up in the queue.
    struct SlowNoVehicles;

    impl VehicleDetector for SlowNoVehicles {
        fn process_frame(
            &mut self,
            _image: &Image,
            _timestamp: DateTime<Utc>,
        ) -> anyhow::Result<Vec<DetectedVehicle>> {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Vec::new())
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_concurrency_above_queue_size_processes_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, worker) = DetectorWorker::from_detector(Box::new(SlowNoVehicles), Some(2));
        worker.spawn_worker_thread();
        let engine = FusionEngine::new(handle, Arc::new(EchoRecognizer), FusionConfig::default());
        let paths: Vec<String> = (0..8)
            .map(|i| write_jpeg(dir.path(), &format!("img_{i}.jpg")))
            .collect();
        let entries = paths.iter().map(|p| entry(p)).collect();

        let BatchResponse::Entries(results) =
            run_batch(&engine, entries, BatchErrorPolicy::PerEntry, 8).await
        else {
            panic!("expected entries");
        };
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| !r.is_error()), "{results:?}");
    }
}
