use crate::{
    detector::{DetectorBackend, DetectorConfig},
    worker::{DetectorHandle, DetectorWorker},
};
use std::time::Instant;
use tracing::{error, info};

/// Information about the initialized detector
#[derive(Debug, Clone)]
pub struct DetectorInfo {
    pub model_name: String,
    pub backend: DetectorBackend,
}

/// Result of detector initialization
pub enum InitResult {
    Success {
        handle: DetectorHandle,
        detector_info: DetectorInfo,
        worker_thread_handle: std::thread::JoinHandle<()>,
    },
    Failed(String),
}

/// Creates a startup thread that initializes the detector. The returned receiver
/// gets the detector handle once initialization is complete.
pub fn spawn_detector_initialization(
    detector_config: DetectorConfig,
    worker_queue_size: Option<usize>,
) -> tokio::sync::oneshot::Receiver<InitResult> {
    let (init_sender, init_receiver) = tokio::sync::oneshot::channel();

    std::thread::spawn(move || {
        startup_worker_thread(init_sender, detector_config, worker_queue_size);
    });

    init_receiver
}

fn startup_worker_thread(
    init_sender: tokio::sync::oneshot::Sender<InitResult>,
    detector_config: DetectorConfig,
    worker_queue_size: Option<usize>,
) {
    info!(
        backend = ?detector_config.backend,
        "Startup worker thread: Beginning detector initialization..."
    );
    let init_start_time = Instant::now();
    let backend = detector_config.backend;

    let result = match DetectorWorker::new(detector_config, worker_queue_size) {
        Ok((handle, detector_worker)) => {
            let detector_info = DetectorInfo {
                model_name: detector_worker.model_name().to_string(),
                backend,
            };
            info!(
                model_name = %detector_info.model_name,
                init_time = ?init_start_time.elapsed(),
                "Startup worker thread: Detector initialization complete, starting worker thread"
            );
            let worker_thread_handle = detector_worker.spawn_worker_thread();
            InitResult::Success {
                handle,
                detector_info,
                worker_thread_handle,
            }
        }
        Err(e) => {
            error!(error = %e, "Startup worker thread: Detector initialization failed");
            InitResult::Failed(format!("{e:#}"))
        }
    };

    if init_sender.send(result).is_err() {
        error!("Startup worker thread: Failed to send initialization result to server");
    } else {
        info!("Startup worker thread: Handover complete");
    }
}
