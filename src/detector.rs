use crate::{
    api::{DetectedVehicle, VehicleCoordinates, VehicleId},
    image::{Image, Resizer, encode_jpeg},
};
use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use ndarray::Array;
use ort::{
    inputs,
    session::{Session, SessionOutputs},
    value::Tensor,
};
use serde::Deserialize;
use smallvec::SmallVec;
use std::{
    fmt::Debug,
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{debug, info};

pub static COCO_CLASSES_STR: &str = include_str!("../assets/coco_classes.yaml");
pub static SMALL_RT_DETR_V2_MODEL_FILE_NAME: &str = "rt-detrv2-s.onnx";

const MODEL_INPUT_SIZE: usize = 640;

/// Blocking vehicle detector. Implementations are owned by the detector worker thread.
pub trait VehicleDetector: Send {
    fn process_frame(
        &mut self,
        image: &Image,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DetectedVehicle>>;

    fn model_name(&self) -> &str;
}

/// A box reported by one of the detector backends, in source image pixels.
#[derive(Clone, PartialEq)]
pub struct Prediction {
    pub x_max: f32,
    pub x_min: f32,
    pub y_max: f32,
    pub y_min: f32,
    pub confidence: f32,
    pub label: String,
}

impl Debug for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prediction")
            .field("label", &self.label)
            .field("confidence", &self.confidence)
            .finish()
    }
}

/// Numbers predictions 1..=n in detector order.
pub fn predictions_to_vehicles<'a, I>(predictions: I) -> Vec<DetectedVehicle>
where
    I: IntoIterator<Item = &'a Prediction>,
{
    predictions
        .into_iter()
        .enumerate()
        .map(|(index, prediction)| {
            DetectedVehicle::new(
                (index + 1) as VehicleId,
                prediction.label.clone(),
                prediction.confidence,
                VehicleCoordinates::from_corners(
                    prediction.x_min,
                    prediction.y_min,
                    prediction.x_max,
                    prediction.y_max,
                ),
            )
        })
        .collect()
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorBackend {
    /// In-process ONNX model
    #[default]
    Onnx,
    /// CodeProject.AI compatible detection endpoint
    Remote,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize, Deserialize)]
pub enum ObjectDetectionModel {
    #[default]
    RtDetrv2,
    Yolo5,
}

impl std::fmt::Display for ObjectDetectionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectDetectionModel::RtDetrv2 => write!(f, "rt-detrv2"),
            ObjectDetectionModel::Yolo5 => write!(f, "yolo5"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub intra_threads: usize,
    pub inter_threads: usize,
    pub gpu_index: i32,
    pub force_cpu: bool,
    pub model: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub backend: DetectorBackend,
    pub onnx: OnnxConfig,
    pub object_detection_model: ObjectDetectionModel,
    pub object_classes: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub remote_url: Option<String>,
    pub remote_timeout: Duration,
}

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct CocoClasses {
    NAMES: Vec<String>,
}

pub fn get_object_classes(yaml_file: Option<PathBuf>) -> anyhow::Result<Vec<String>> {
    let yaml_data = match yaml_file {
        Some(yaml_file) => std::fs::read_to_string(&yaml_file)
            .with_context(|| format!("Failed to read {}", yaml_file.display()))?,
        None => COCO_CLASSES_STR.to_string(),
    };
    Ok(serde_yaml::from_str::<CocoClasses>(yaml_data.as_str())?.NAMES)
}

/// Creates the configured backend. Loading an ONNX model can take a while, so this
/// runs on the startup thread.
pub fn build_detector(config: DetectorConfig) -> anyhow::Result<Box<dyn VehicleDetector>> {
    match config.backend {
        DetectorBackend::Onnx => Ok(Box::new(OnnxVehicleDetector::new(config)?)),
        DetectorBackend::Remote => Ok(Box::new(RemoteVehicleDetector::new(config)?)),
    }
}

pub struct OnnxVehicleDetector {
    session: Session,
    resizer: Resizer,
    resized_image: Image,
    object_classes: Vec<String>,
    confidence_threshold: f32,
    model_name: String,
    object_detection_model: ObjectDetectionModel,
}

impl OnnxVehicleDetector {
    pub fn new(config: DetectorConfig) -> anyhow::Result<Self> {
        let object_classes = get_object_classes(config.object_classes)?;
        let (model_name, session) = initialize_onnx(&config.onnx)?;

        let mut detector = Self {
            session,
            resizer: Resizer::default(),
            resized_image: Image::default(),
            object_classes,
            confidence_threshold: config.confidence_threshold,
            model_name,
            object_detection_model: config.object_detection_model,
        };

        info!("Warming up the detector");
        let warmup_start_time = Instant::now();
        let blank = Image::new(
            None,
            MODEL_INPUT_SIZE,
            MODEL_INPUT_SIZE,
            vec![0; MODEL_INPUT_SIZE * MODEL_INPUT_SIZE * 3],
        )?;
        detector.detect(&blank)?;
        info!("Detector warmed up in: {:?}", warmup_start_time.elapsed());

        Ok(detector)
    }

    fn detect(&mut self, image: &Image) -> anyhow::Result<SmallVec<[Prediction; 10]>> {
        let processing_time_start = Instant::now();
        let resize_factor_x = image.width as f32 / MODEL_INPUT_SIZE as f32;
        let resize_factor_y = image.height as f32 / MODEL_INPUT_SIZE as f32;

        self.resizer.resize_image(image, &mut self.resized_image)?;

        let mut input = Array::<f32, _>::zeros((1, 3, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE));
        for (index, chunk) in self.resized_image.pixels.chunks_exact(3).enumerate() {
            let y = index / MODEL_INPUT_SIZE;
            let x = index % MODEL_INPUT_SIZE;
            input[[0, 0, y, x]] = chunk[0] as f32 / 255.0;
            input[[0, 1, y, x]] = chunk[1] as f32 / 255.0;
            input[[0, 2, y, x]] = chunk[2] as f32 / 255.0;
        }
        debug!("Pre-process time: {:?}", processing_time_start.elapsed());

        let inference_start_time = Instant::now();
        let images = Tensor::from_array(input)?;
        let outputs: SessionOutputs = match self.object_detection_model {
            ObjectDetectionModel::RtDetrv2 => {
                let orig_size = Tensor::from_array(Array::from_shape_vec(
                    (1, 2),
                    vec![MODEL_INPUT_SIZE as i64, MODEL_INPUT_SIZE as i64],
                )?)?;
                self.session
                    .run(inputs!["images" => images, "orig_target_sizes" => orig_size])?
            }
            ObjectDetectionModel::Yolo5 => self.session.run(inputs!["images" => images])?,
        };
        debug!("Inference time: {:?}", inference_start_time.elapsed());

        let predictions = match self.object_detection_model {
            ObjectDetectionModel::RtDetrv2 => rt_detrv2_post_process(
                &outputs,
                self.confidence_threshold,
                resize_factor_x,
                resize_factor_y,
                &self.object_classes,
            )?,
            ObjectDetectionModel::Yolo5 => yolo5_post_process(
                &outputs,
                self.confidence_threshold,
                resize_factor_x,
                resize_factor_y,
                &self.object_classes,
            )?,
        };
        debug!("Processing time: {:?}", processing_time_start.elapsed());
        Ok(predictions)
    }
}

impl VehicleDetector for OnnxVehicleDetector {
    fn process_frame(
        &mut self,
        image: &Image,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DetectedVehicle>> {
        let predictions = self.detect(image)?;
        debug!(%timestamp, count = predictions.len(), "Detected objects");
        Ok(predictions_to_vehicles(predictions.iter()))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

fn class_label(object_classes: &[String], index: usize) -> anyhow::Result<String> {
    object_classes.get(index).cloned().ok_or_else(|| {
        anyhow!(
            "Model returned class {index} but only {} classes are known, \
             does the classes YAML match the model?",
            object_classes.len()
        )
    })
}

fn rt_detrv2_post_process(
    outputs: &SessionOutputs<'_>,
    confidence_threshold: f32,
    resize_factor_x: f32,
    resize_factor_y: f32,
    object_classes: &[String],
) -> anyhow::Result<SmallVec<[Prediction; 10]>> {
    let (_, labels) = outputs
        .get("labels")
        .context("Missing labels output")?
        .try_extract_tensor::<i64>()?;
    let (_, bboxes) = outputs
        .get("boxes")
        .context("Missing boxes output")?
        .try_extract_tensor::<f32>()?;
    let (_, scores) = outputs
        .get("scores")
        .context("Missing scores output")?
        .try_extract_tensor::<f32>()?;

    let mut predictions = SmallVec::<[Prediction; 10]>::new();
    for (i, bbox) in bboxes.chunks_exact(4).enumerate() {
        let (Some(&score), Some(&label)) = (scores.get(i), labels.get(i)) else {
            break;
        };
        if score <= confidence_threshold {
            continue;
        }
        let prediction = Prediction {
            x_min: bbox[0] * resize_factor_x,
            y_min: bbox[1] * resize_factor_y,
            x_max: bbox[2] * resize_factor_x,
            y_max: bbox[3] * resize_factor_y,
            confidence: score,
            label: class_label(object_classes, label as usize)?,
        };
        debug!("Prediction - {}: {:?}", predictions.len() + 1, prediction);
        predictions.push(prediction);
    }
    Ok(predictions)
}

fn yolo5_post_process(
    outputs: &SessionOutputs<'_>,
    confidence_threshold: f32,
    resize_factor_x: f32,
    resize_factor_y: f32,
    object_classes: &[String],
) -> anyhow::Result<SmallVec<[Prediction; 10]>> {
    let output = outputs.values().next().ok_or(anyhow!("No outputs"))?;
    let (shape, data) = output.try_extract_tensor::<f32>()?;
    let stride = shape.last().copied().unwrap_or_default() as usize;
    if stride != 5 + object_classes.len() {
        bail!(
            "Unexpected yolo output shape, expected {} values per row, got {}. \
             This probably means that your classes YAML file does not match the model.",
            5 + object_classes.len(),
            stride
        );
    }

    let mut predictions = SmallVec::<[Prediction; 10]>::new();
    for row in data.chunks_exact(stride) {
        if row[4] <= confidence_threshold {
            continue;
        }
        let class_idx = row[5..]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        let x_center = row[0] * resize_factor_x;
        let y_center = row[1] * resize_factor_y;
        let width = row[2] * resize_factor_x;
        let height = row[3] * resize_factor_y;
        predictions.push(Prediction {
            x_min: x_center - width / 2.0,
            y_min: y_center - height / 2.0,
            x_max: x_center + width / 2.0,
            y_max: y_center + height / 2.0,
            confidence: row[4],
            label: class_label(object_classes, class_idx)?,
        });
    }

    // Remove overlapping boxes
    let predictions = non_maximum_suppression(predictions, 0.5);
    for (i, prediction) in predictions.iter().enumerate() {
        debug!("Prediction - {}: {:?}", i + 1, prediction);
    }
    Ok(predictions)
}

fn non_maximum_suppression(
    mut predictions: SmallVec<[Prediction; 10]>,
    iou_threshold: f32,
) -> SmallVec<[Prediction; 10]> {
    predictions.sort_by(|a, b| {
        a.label
            .cmp(&b.label)
            .then(b.confidence.total_cmp(&a.confidence))
    });

    let mut kept: SmallVec<[Prediction; 10]> = SmallVec::new();
    for pred in predictions {
        let overlaps = kept
            .iter()
            .any(|k| k.label == pred.label && calculate_iou(&pred, k) >= iou_threshold);
        if !overlaps {
            kept.push(pred);
        }
    }
    kept
}

fn calculate_iou(a: &Prediction, b: &Prediction) -> f32 {
    let x_min = a.x_min.max(b.x_min);
    let y_min = a.y_min.max(b.y_min);
    let x_max = a.x_max.min(b.x_max);
    let y_max = a.y_max.min(b.y_max);
    let intersection = (x_max - x_min).max(0.0) * (y_max - y_min).max(0.0);
    let area_a = (a.x_max - a.x_min) * (a.y_max - a.y_min);
    let area_b = (b.x_max - b.x_min) * (b.y_max - b.y_min);
    let union = area_a + area_b - intersection;

    if union <= 0.0 { 0.0 } else { intersection / union }
}

fn initialize_onnx(onnx_config: &OnnxConfig) -> anyhow::Result<(String, Session)> {
    let max_threads = num_cpus::get_physical().saturating_sub(1).max(1);
    let num_intra_threads = onnx_config.intra_threads.min(max_threads);
    let num_inter_threads = onnx_config.inter_threads.min(max_threads);

    let model_path = match onnx_config.model.clone() {
        Some(model) => model,
        None => std::env::current_exe()?
            .parent()
            .ok_or_else(|| anyhow!("Failed to get parent directory of executable path"))?
            .join(SMALL_RT_DETR_V2_MODEL_FILE_NAME),
    };
    let model_bytes = std::fs::read(&model_path).with_context(|| {
        format!(
            "Failed to read model file {}, specify --model or run plate_fusion_download_models",
            model_path.display()
        )
    })?;
    let model_name = model_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| SMALL_RT_DETR_V2_MODEL_FILE_NAME.to_string());

    let mut builder = Session::builder()?
        .with_intra_threads(num_intra_threads)?
        .with_inter_threads(num_inter_threads)?;

    #[cfg(windows)]
    if !onnx_config.force_cpu {
        use ort::execution_providers::DirectMLExecutionProvider;
        info!(gpu_index = onnx_config.gpu_index, "Trying DirectML for inference");
        builder = builder.with_execution_providers([DirectMLExecutionProvider::default()
            .with_device_id(onnx_config.gpu_index)
            .build()])?;
    }
    #[cfg(target_os = "linux")]
    if !onnx_config.force_cpu {
        use ort::execution_providers::OpenVINOExecutionProvider;
        info!("Trying OpenVINO for inference");
        builder = builder
            .with_execution_providers([OpenVINOExecutionProvider::default().build()])?;
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    if !onnx_config.force_cpu {
        tracing::warn!(
            gpu_index = onnx_config.gpu_index,
            "No accelerated execution provider on this platform, using CPU"
        );
    }

    info!(
        "Initializing detector with model: {:?}, {} intra and {} inter threads",
        model_name, num_intra_threads, num_inter_threads
    );
    let session = builder.commit_from_memory(model_bytes.as_slice())?;
    Ok((model_name, session))
}

#[derive(Debug, Deserialize)]
struct RemotePrediction {
    x_max: f32,
    x_min: f32,
    y_max: f32,
    y_min: f32,
    confidence: f32,
    label: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RemoteDetectionResponse {
    success: bool,
    error: Option<String>,
    predictions: Vec<RemotePrediction>,
    #[serde(rename = "moduleId")]
    module_id: String,
}

impl Default for RemoteDetectionResponse {
    fn default() -> Self {
        Self {
            success: true,
            error: None,
            predictions: Vec::new(),
            module_id: String::new(),
        }
    }
}

/// Talks to a CodeProject.AI style `/v1/vision/detection` endpoint.
pub struct RemoteVehicleDetector {
    client: reqwest::blocking::Client,
    url: reqwest::Url,
    min_confidence: f32,
    model_name: String,
}

impl RemoteVehicleDetector {
    pub fn new(config: DetectorConfig) -> anyhow::Result<Self> {
        let origin = config
            .remote_url
            .ok_or_else(|| anyhow!("--detector-url is required for the remote detector"))?;
        let url = reqwest::Url::parse(&origin)
            .with_context(|| format!("Invalid detector url {origin}"))?
            .join("v1/vision/detection")?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.remote_timeout)
            .build()?;
        info!(%url, "Using remote vehicle detector");
        Ok(Self {
            client,
            url,
            min_confidence: config.confidence_threshold,
            model_name: format!("remote:{origin}"),
        })
    }
}

impl VehicleDetector for RemoteVehicleDetector {
    fn process_frame(
        &mut self,
        image: &Image,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DetectedVehicle>> {
        let jpeg = encode_jpeg(image, 95)?;
        let image_part = reqwest::blocking::multipart::Part::bytes(jpeg)
            .file_name("image.jpg")
            .mime_str(mime::IMAGE_JPEG.as_ref())?;
        let form = reqwest::blocking::multipart::Form::new()
            .text("min_confidence", self.min_confidence.to_string())
            .part("image", image_part);

        let response = self.client.post(self.url.clone()).multipart(form).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("Detector request failed with status {status}: {body}");
        }
        let response: RemoteDetectionResponse = response.json()?;
        if !response.success {
            bail!(
                "Detector reported failure: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        debug!(
            %timestamp,
            module_id = %response.module_id,
            count = response.predictions.len(),
            "Remote detection done"
        );

        let predictions: Vec<Prediction> = response
            .predictions
            .into_iter()
            .map(|p| Prediction {
                x_max: p.x_max,
                x_min: p.x_min,
                y_max: p.y_max,
                y_min: p.y_min,
                confidence: p.confidence,
                label: p.label,
            })
            .collect();
        Ok(predictions_to_vehicles(predictions.iter()))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
