use crate::{
    LogLevel,
    batch::BatchErrorPolicy,
    detector::{DetectorBackend, DetectorConfig, ObjectDetectionModel, OnnxConfig},
    fusion::TieBreak,
    pipeline::FusionConfig,
    region::{DEFAULT_VEHICLE_TYPES, VehicleTypeFilter},
    server::ServerConfig,
};
use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tracing::info;

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    about = "Vehicle detection and number plate recognition fusion service"
)]
#[serde(default)]
pub struct Cli {
    /// Load the whole configuration from a JSON file, other arguments are ignored.
    /// Example: --config plate_fusion.json
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,
    /// The port on which the server will listen for HTTP requests.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
    /// Where vehicle detection runs
    #[arg(long, value_enum, default_value_t = DetectorBackend::Onnx)]
    pub detector: DetectorBackend,
    /// Path to the ONNX model file.
    /// If not given the small rt-detrv2 model next to the binary is used.
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Type of the ONNX model
    #[arg(long, value_enum, default_value_t = ObjectDetectionModel::RtDetrv2)]
    pub object_detection_model_type: ObjectDetectionModel,
    /// Path to the object classes yaml file
    /// Default: the 80 standard COCO classes
    #[arg(long)]
    pub object_classes: Option<PathBuf>,
    /// Confidence threshold for vehicle detection
    #[arg(long, default_value_t = 0.5)]
    pub confidence_threshold: f32,
    /// Origin of a CodeProject.AI compatible detection server, used with --detector remote.
    /// Example: --detector-url http://127.0.0.1:32168
    #[arg(long)]
    pub detector_url: Option<String>,
    /// Timeout in seconds for one remote detection request
    #[arg(long, default_value_t = 10)]
    pub detector_timeout: u64,
    /// Force using CPU for inference
    #[arg(long, default_value_t = false)]
    pub force_cpu: bool,
    /// GPU Index, best effort to select the correct one if multiple GPUs exist.
    #[arg(long, default_value_t = 0)]
    pub gpu_index: i32,
    /// Intra thread parallelism max is cpu cores - 1
    #[arg(long, default_value_t = 192)]
    pub intra_threads: usize,
    /// Inter thread parallelism max is cpu cores - 1
    #[arg(long, default_value_t = 192)]
    pub inter_threads: usize,
    /// URL of the plate recognition endpoint. Images are posted as multipart `images` parts.
    #[arg(long, default_value = "http://127.0.0.1:8001/anpr")]
    pub recognizer_url: String,
    /// Timeout in seconds for one recognizer request
    #[arg(long, default_value_t = 30)]
    pub recognizer_timeout: u64,
    /// Vehicle types that are cropped and sent to the recognizer. Provide types separated by ','.
    #[arg(
        long,
        value_delimiter = ',',
        num_args = 1..,
        default_values_t = DEFAULT_VEHICLE_TYPES.map(String::from)
    )]
    pub vehicle_types: Vec<String>,
    /// How to pick one plate when several are read on the same vehicle
    #[arg(long, value_enum, default_value_t = TieBreak::HighestConfidence)]
    pub tie_break: TieBreak,
    /// Drop whole image plates without detection confidence or text
    #[arg(long, default_value_t = false)]
    pub drop_unread_fallback_plates: bool,
    /// Timeout in seconds for processing one image
    #[arg(long, default_value_t = 30)]
    pub image_timeout: u64,
    /// Max number of images waiting for the detector. Default is 16.
    #[arg(long)]
    pub worker_queue_size: Option<usize>,
    /// What happens when an entry of a JSON batch fails
    #[arg(long, value_enum, default_value_t = BatchErrorPolicy::PerEntry)]
    pub batch_error_policy: BatchErrorPolicy,
    /// Number of batch images processed concurrently, results keep input order
    #[arg(long, default_value_t = 1)]
    pub batch_concurrency: usize,
    /// Optional path to save processed images with vehicle and plate boxes drawn
    #[arg(long)]
    pub save_image_path: Option<PathBuf>,
    /// Sets the level of logging
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
    /// If log_path is set, then stdout logging will be disabled and it will log to file
    #[arg(long)]
    pub log_path: Option<PathBuf>,
}

impl Default for Cli {
    fn default() -> Self {
        Cli::parse_from([env!("CARGO_PKG_NAME")])
    }
}

impl Cli {
    /// Parses the command line, then replaces everything with `--config` if given.
    pub fn from_config_and_args() -> anyhow::Result<Self> {
        let args = Cli::parse();
        match args.config.clone() {
            Some(config_path) => Cli::load_config(config_path),
            None => Ok(args),
        }
    }

    pub fn load_config(config_path: PathBuf) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;
        let mut cli: Cli = serde_json::from_str(&data)
            .with_context(|| format!("Invalid config {}", config_path.display()))?;
        cli.config = Some(config_path);
        Ok(cli)
    }

    pub fn save_config(&self, config_path: &std::path::Path) -> anyhow::Result<()> {
        std::fs::write(config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", config_path.display()))
    }

    pub fn print_config(&self) {
        info!("Configuration:");
        if let Some(config) = &self.config {
            info!("  config: {}", config.display());
        }
        info!("  port: {}", self.port);
        info!("  detector: {:?}", self.detector);
        match self.detector {
            DetectorBackend::Onnx => {
                info!("  model: {:?}", self.model);
                info!("  object_detection_model_type: {}", self.object_detection_model_type);
                info!("  object_classes: {:?}", self.object_classes);
                info!("  force_cpu: {}", self.force_cpu);
                info!("  gpu_index: {}", self.gpu_index);
                info!("  intra_threads: {}", self.intra_threads);
                info!("  inter_threads: {}", self.inter_threads);
            }
            DetectorBackend::Remote => {
                info!("  detector_url: {:?}", self.detector_url);
                info!("  detector_timeout: {}s", self.detector_timeout);
            }
        }
        info!("  confidence_threshold: {}", self.confidence_threshold);
        info!("  recognizer_url: {}", self.recognizer_url);
        info!("  recognizer_timeout: {}s", self.recognizer_timeout);
        info!("  vehicle_types: {}", self.vehicle_types.join(","));
        info!("  tie_break: {}", self.tie_break);
        info!("  drop_unread_fallback_plates: {}", self.drop_unread_fallback_plates);
        info!("  image_timeout: {}s", self.image_timeout);
        info!("  worker_queue_size: {:?}", self.worker_queue_size);
        info!("  batch_error_policy: {:?}", self.batch_error_policy);
        info!("  batch_concurrency: {}", self.batch_concurrency);
        info!("  save_image_path: {:?}", self.save_image_path);
        info!("  log_level: {:?}", self.log_level);
        info!("  log_path: {:?}", self.log_path);
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            backend: self.detector,
            onnx: OnnxConfig {
                intra_threads: self.intra_threads,
                inter_threads: self.inter_threads,
                gpu_index: self.gpu_index,
                force_cpu: self.force_cpu,
                model: self.model.clone(),
            },
            object_detection_model: self.object_detection_model_type.clone(),
            object_classes: self.object_classes.clone(),
            confidence_threshold: self.confidence_threshold,
            remote_url: self.detector_url.clone(),
            remote_timeout: Duration::from_secs(self.detector_timeout),
        }
    }

    pub fn fusion_config(&self) -> FusionConfig {
        FusionConfig {
            vehicle_filter: VehicleTypeFilter::new(&self.vehicle_types),
            tie_break: self.tie_break,
            drop_unread_fallback_plates: self.drop_unread_fallback_plates,
            image_timeout: Duration::from_secs(self.image_timeout),
            save_image_path: self.save_image_path.clone(),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            fusion: self.fusion_config(),
            batch_error_policy: self.batch_error_policy,
            batch_concurrency: self.batch_concurrency,
            log_path: self.log_path.clone(),
        }
    }
}
