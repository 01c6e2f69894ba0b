//! Per-image processing: detect, extract, recognize, fuse.

use crate::{
    api::{PlateCandidate, ResultBundle},
    fusion::{TieBreak, fuse_vehicles, needs_fallback, plate_records},
    image::{
        Image, create_fused_image_name, create_random_jpeg_name, decode_image,
        save_result_bundle_jpeg,
    },
    recognizer::PlateRecognizer,
    region::{VehicleTypeFilter, extract_regions},
    worker::DetectorHandle,
};
use anyhow::{Context, anyhow};
use bytes::Bytes;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub vehicle_filter: VehicleTypeFilter,
    pub tie_break: TieBreak,
    pub drop_unread_fallback_plates: bool,
    pub image_timeout: Duration,
    pub save_image_path: Option<PathBuf>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            vehicle_filter: VehicleTypeFilter::default(),
            tie_break: TieBreak::default(),
            drop_unread_fallback_plates: false,
            image_timeout: DEFAULT_IMAGE_TIMEOUT,
            save_image_path: None,
        }
    }
}

pub struct FusionEngine {
    detector: DetectorHandle,
    recognizer: Arc<dyn PlateRecognizer>,
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(
        detector: DetectorHandle,
        recognizer: Arc<dyn PlateRecognizer>,
        config: FusionConfig,
    ) -> Self {
        Self {
            detector,
            recognizer,
            config,
        }
    }

    /// Images that can wait for the detector at once.
    pub fn detector_capacity(&self) -> usize {
        self.detector.queue_capacity()
    }

    /// Decodes an upload off the async runtime and processes it.
    pub async fn process_bytes(
        &self,
        name: Option<String>,
        data: Bytes,
    ) -> anyhow::Result<ResultBundle> {
        let image = tokio::task::spawn_blocking(move || decode_image(name, &data)).await??;
        self.process_image(image).await
    }

    pub async fn process_file(&self, path: &Path) -> anyhow::Result<ResultBundle> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.process_bytes(Some(path.to_string_lossy().to_string()), Bytes::from(data))
            .await
    }

    /// Runs one image through the pipeline under the per-image timeout.
    pub async fn process_image(&self, image: Image) -> anyhow::Result<ResultBundle> {
        let processing_start_time = Instant::now();
        let image = Arc::new(image);
        let bundle = tokio::time::timeout(self.config.image_timeout, self.fuse(image.clone()))
            .await
            .map_err(|_| {
                anyhow!(
                    "Processing {} timed out after {:?}",
                    image.name.as_deref().unwrap_or("image"),
                    self.config.image_timeout
                )
            })??;

        info!(
            image = %image,
            vehicles = bundle.vehicles.len(),
            plates = bundle.plates.len(),
            processing_time = ?processing_start_time.elapsed(),
            "Image processed"
        );

        if let Some(save_image_path) = self.config.save_image_path.clone() {
            let bundle = bundle.clone();
            let saved = tokio::task::spawn_blocking(move || {
                save_debug_image(&image, &bundle, &save_image_path)
            })
            .await;
            match saved {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "Failed to save debug image"),
                Err(err) => warn!(%err, "Debug image task panicked"),
            }
        }
        Ok(bundle)
    }

    async fn fuse(&self, image: Arc<Image>) -> anyhow::Result<ResultBundle> {
        let vehicles = self
            .detector
            .detect(image.clone())
            .await
            .context("Vehicle detection failed")?;

        if vehicles.is_empty() {
            debug!("No vehicles detected, recognizing plates on the whole image");
            let whole = self.recognize_whole_image(&image).await?;
            return Ok(ResultBundle {
                vehicles: Vec::new(),
                plates: plate_records(whole, false),
            });
        }

        let crops = extract_regions(&image, &vehicles, &self.config.vehicle_filter);
        debug!(detected = vehicles.len(), kept = crops.len(), "Vehicle regions extracted");

        let records = if crops.is_empty() {
            Vec::new()
        } else {
            let crop_images: Vec<Image> = crops.iter().map(|crop| crop.image.clone()).collect();
            let candidates = self
                .recognizer
                .run(&crop_images)
                .await
                .context("Plate recognition failed")?;
            fuse_vehicles(&crops, candidates, self.config.tie_break)?
        };

        let plates = if needs_fallback(&records) {
            debug!("No plate text on any vehicle, falling back to the whole image");
            let whole = self.recognize_whole_image(&image).await?;
            plate_records(whole, self.config.drop_unread_fallback_plates)
        } else {
            Vec::new()
        };

        Ok(ResultBundle {
            vehicles: records,
            plates,
        })
    }

    async fn recognize_whole_image(
        &self,
        image: &Image,
    ) -> anyhow::Result<Vec<Vec<PlateCandidate>>> {
        self.recognizer
            .run(std::slice::from_ref(image))
            .await
            .context("Whole image plate recognition failed")
    }
}

fn save_debug_image(
    image: &Image,
    bundle: &ResultBundle,
    save_image_path: &Path,
) -> anyhow::Result<()> {
    let name = image.name.clone().unwrap_or_else(create_random_jpeg_name);
    let file_name = create_fused_image_name(&name)?;
    save_result_bundle_jpeg(image, bundle, &save_image_path.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{DetectedVehicle, VehicleCoordinates},
        detector::VehicleDetector,
        worker::DetectorWorker,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::{collections::VecDeque, sync::Mutex};

    struct FixedDetector {
        result: Option<Vec<DetectedVehicle>>,
    }

    impl VehicleDetector for FixedDetector {
        fn process_frame(
            &mut self,
            _image: &Image,
            _timestamp: DateTime<Utc>,
        ) -> anyhow::Result<Vec<DetectedVehicle>> {
            self.result.clone().ok_or_else(|| anyhow!("detector offline"))
        }

        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    #[derive(Default)]
    struct ScriptedRecognizer {
        responses: Mutex<VecDeque<Vec<Vec<PlateCandidate>>>>,
        calls: Mutex<Vec<usize>>,
        delay: Option<Duration>,
    }

    impl ScriptedRecognizer {
        fn new(responses: Vec<Vec<Vec<PlateCandidate>>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlateRecognizer for ScriptedRecognizer {
        async fn run(&self, images: &[Image]) -> anyhow::Result<Vec<Vec<PlateCandidate>>> {
            self.calls.lock().unwrap().push(images.len());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let response = self.responses.lock().unwrap().pop_front();
            response.ok_or_else(|| anyhow!("no scripted response"))
        }
    }

    fn vehicle(id: u64, vehicle_type: &str, x: f32, y: f32, w: f32, h: f32) -> DetectedVehicle {
        DetectedVehicle::new(
            id,
            vehicle_type,
            0.8,
            VehicleCoordinates {
                x,
                y,
                width: w,
                height: h,
            },
        )
    }

    fn plate(text: &str, det_conf: Option<f32>) -> PlateCandidate {
        PlateCandidate::new(
            Some(&[2.0, 3.0, 12.0, 8.0][..]),
            det_conf,
            Some(text.to_string()),
            Some(0.9),
        )
    }

    fn blank() -> Image {
        Image::new(Some("frame.png".to_string()), 200, 200, vec![0; 200 * 200 * 3]).unwrap()
    }

    fn engine(
        vehicles: Option<Vec<DetectedVehicle>>,
        recognizer: Arc<ScriptedRecognizer>,
        config: FusionConfig,
    ) -> FusionEngine {
        let (handle, worker) =
            DetectorWorker::from_detector(Box::new(FixedDetector { result: vehicles }), Some(4));
        worker.spawn_worker_thread();
        FusionEngine::new(handle, recognizer, config)
    }

    #[tokio::test]
    async fn test_no_vehicles_returns_whole_image_plates() {
        let whole = vec![vec![plate("AB123", Some(0.7)), plate("", None)]];
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![whole.clone()]));
        let engine = engine(Some(vec![]), recognizer.clone(), FusionConfig::default());

        let bundle = engine.process_image(blank()).await.unwrap();
        assert!(bundle.vehicles.is_empty());
        assert_eq!(bundle.plates, plate_records(whole, false));
        assert_eq!(bundle.plates.len(), 2);
        assert_eq!(recognizer.calls(), vec![1]);
    }

    #[tokio::test]
    async fn test_plates_attach_to_kept_vehicles() {
        let vehicles = vec![
            vehicle(7, "car", 50.0, 50.0, 20.0, 20.0),
            vehicle(8, "person", 100.0, 100.0, 20.0, 40.0),
            vehicle(9, "truck", 150.0, 150.0, 40.0, 20.0),
        ];
        // Crop 0 is vehicle 7, crop 1 is vehicle 9.
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![vec![
            vec![],
            vec![plate("LOW", Some(0.4)), plate("HIGH", Some(0.9))],
        ]]));
        let engine = engine(Some(vehicles), recognizer.clone(), FusionConfig::default());

        let bundle = engine.process_image(blank()).await.unwrap();
        assert_eq!(bundle.vehicles.len(), 2);
        assert_eq!(bundle.vehicles[0].vehicle_id, 7);
        assert!(bundle.vehicles[0].recognition_text.is_none());
        assert_eq!(bundle.vehicles[1].vehicle_id, 9);
        assert_eq!(bundle.vehicles[1].vehicle_type, "truck");
        assert_eq!(bundle.vehicles[1].detection_confidence, 0.8);
        assert_eq!(bundle.vehicles[1].recognition_text.as_deref(), Some("HIGH"));
        assert!(bundle.plates.is_empty());
        assert_eq!(recognizer.calls(), vec![2]);
    }

    #[tokio::test]
    async fn test_last_wins_config() {
        let vehicles = vec![vehicle(1, "car", 50.0, 50.0, 20.0, 20.0)];
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![vec![vec![
            plate("HIGH", Some(0.9)),
            plate("LOW", Some(0.4)),
        ]]]));
        let config = FusionConfig {
            tie_break: TieBreak::LastWins,
            ..Default::default()
        };
        let engine = engine(Some(vehicles), recognizer, config);

        let bundle = engine.process_image(blank()).await.unwrap();
        assert_eq!(bundle.vehicles[0].recognition_text.as_deref(), Some("LOW"));
    }

    #[tokio::test]
    async fn test_fallback_when_no_text_on_vehicles() {
        let vehicles = vec![
            vehicle(1, "car", 50.0, 50.0, 20.0, 20.0),
            vehicle(2, "bus", 150.0, 150.0, 40.0, 20.0),
        ];
        let whole = vec![vec![plate("ZZ999", Some(0.6)), plate("", Some(0.3))]];
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![
            vec![vec![plate("", Some(0.5))], vec![]],
            whole.clone(),
        ]));
        let engine = engine(Some(vehicles), recognizer.clone(), FusionConfig::default());

        let bundle = engine.process_image(blank()).await.unwrap();
        assert_eq!(recognizer.calls(), vec![2, 1]);
        assert_eq!(bundle.plates, plate_records(whole, false));
        assert_eq!(bundle.vehicles.len(), 2);
        assert_eq!(bundle.vehicles[0].recognition_text.as_deref(), Some(""));
        assert_eq!(bundle.vehicles[0].plate_detection_confidence, Some(0.5));
        assert!(bundle.vehicles[1].recognition_text.is_none());
    }

    #[tokio::test]
    async fn test_fallback_filter_drops_unread_plates() {
        let vehicles = vec![vehicle(1, "car", 50.0, 50.0, 20.0, 20.0)];
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![
            vec![vec![]],
            vec![vec![plate("ZZ999", Some(0.6)), plate("", Some(0.3)), plate("NOCONF", None)]],
        ]));
        let config = FusionConfig {
            drop_unread_fallback_plates: true,
            ..Default::default()
        };
        let engine = engine(Some(vehicles), recognizer, config);

        let bundle = engine.process_image(blank()).await.unwrap();
        assert_eq!(bundle.plates.len(), 1);
        assert_eq!(bundle.plates[0].recognition_text, "ZZ999");
    }

    #[tokio::test]
    async fn test_no_surviving_crop_skips_empty_batch() {
        let vehicles = vec![
            vehicle(1, "person", 50.0, 50.0, 20.0, 20.0),
            vehicle(2, "car", 500.0, 500.0, 20.0, 20.0),
        ];
        let recognizer =
            Arc::new(ScriptedRecognizer::new(vec![vec![vec![plate("W1", Some(0.5))]]]));
        let engine = engine(Some(vehicles), recognizer.clone(), FusionConfig::default());

        let bundle = engine.process_image(blank()).await.unwrap();
        assert!(bundle.vehicles.is_empty());
        assert_eq!(bundle.plates.len(), 1);
        assert_eq!(recognizer.calls(), vec![1]);
    }

    #[tokio::test]
    async fn test_detector_failure_is_an_error() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let engine = engine(None, recognizer.clone(), FusionConfig::default());
        let err = engine.process_image(blank()).await.unwrap_err();
        assert!(format!("{err:#}").contains("detector offline"));
        assert!(recognizer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let recognizer = Arc::new(ScriptedRecognizer {
            delay: Some(Duration::from_secs(5)),
            ..ScriptedRecognizer::new(vec![vec![vec![]]])
        });
        let config = FusionConfig {
            image_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let engine = engine(Some(vec![]), recognizer, config);
        let err = engine.process_image(blank()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_save_debug_image() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer =
            Arc::new(ScriptedRecognizer::new(vec![vec![vec![plate("AB1", Some(0.5))]]]));
        let config = FusionConfig {
            save_image_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let engine = engine(Some(vec![]), recognizer, config);
        engine.process_image(blank()).await.unwrap();
        assert!(dir.path().join("frame_fused.jpg").exists());
    }
}
