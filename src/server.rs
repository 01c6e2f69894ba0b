use crate::{
    api::{ErrorResponse, ResultBundle},
    batch::{BatchErrorPolicy, BatchResponse, parse_entries, run_batch},
    image::decode_image,
    pipeline::{FusionConfig, FusionEngine},
    recognizer::PlateRecognizer,
    startup_coordinator::{DetectorInfo, InitResult},
};
use askama::Template;
use axum::{
    Json, Router,
    body::{self, Body},
    extract::{DefaultBodyLimit, Multipart, State},
    http::{Request, StatusCode, header::CACHE_CONTROL},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MEGABYTE: usize = 1024 * 1024; // 1 MB = 1024 * 1024 bytes
const THIRTY_MEGABYTES: usize = 30 * MEGABYTE; // 30 MB in bytes

enum DetectorReady {
    NotReady,
    Ready {
        engine: Arc<FusionEngine>,
        worker_thread_handle: Option<std::thread::JoinHandle<()>>,
    },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub fusion: FusionConfig,
    pub batch_error_policy: BatchErrorPolicy,
    pub batch_concurrency: usize,
    pub log_path: Option<PathBuf>,
}

struct ServerState {
    detector_ready: Mutex<DetectorReady>,
    metrics: Mutex<Metrics>,
    recognizer: Arc<dyn PlateRecognizer>,
    fusion_config: FusionConfig,
    batch_error_policy: BatchErrorPolicy,
    batch_concurrency: usize,
}

impl ServerState {
    fn new(config: &ServerConfig, recognizer: Arc<dyn PlateRecognizer>) -> Self {
        Self {
            detector_ready: Mutex::new(DetectorReady::NotReady),
            metrics: Mutex::new(Metrics::new(
                "Initializing...".to_string(),
                config.log_path.clone(),
            )),
            recognizer,
            fusion_config: config.fusion.clone(),
            batch_error_policy: config.batch_error_policy,
            batch_concurrency: config.batch_concurrency,
        }
    }

    async fn apply_init_result(&self, init_result: Result<InitResult, String>) {
        let ready = match init_result {
            Ok(InitResult::Success {
                handle,
                detector_info,
                worker_thread_handle,
            }) => {
                info!(
                    model_name = %detector_info.model_name,
                    backend = ?detector_info.backend,
                    "Detector ready - server can now handle requests"
                );
                self.metrics.lock().await.update_detector_info(&detector_info);
                let engine =
                    FusionEngine::new(handle, self.recognizer.clone(), self.fusion_config.clone());
                DetectorReady::Ready {
                    engine: Arc::new(engine),
                    worker_thread_handle: Some(worker_thread_handle),
                }
            }
            Ok(InitResult::Failed(error)) => {
                error!(error = %error, "Detector initialization failed");
                DetectorReady::Failed(error)
            }
            Err(error) => {
                error!(error = %error, "Detector initialization channel was dropped");
                DetectorReady::Failed(error)
            }
        };
        *self.detector_ready.lock().await = ready;
    }

    async fn engine(&self) -> Result<Arc<FusionEngine>, PlateFusionError> {
        match &*self.detector_ready.lock().await {
            DetectorReady::NotReady => Err(PlateFusionError::with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                anyhow::anyhow!("Server not ready yet, detector is still initializing"),
            )),
            DetectorReady::Failed(error_msg) => Err(PlateFusionError::from(anyhow::anyhow!(
                "Detector initialization failed: {error_msg}"
            ))),
            DetectorReady::Ready { engine, .. } => Ok(engine.clone()),
        }
    }

    /// Extract the worker thread handle for clean shutdown
    async fn take_worker_thread_handle(&self) -> Option<std::thread::JoinHandle<()>> {
        let mut detector_ready = self.detector_ready.lock().await;
        match &mut *detector_ready {
            DetectorReady::Ready {
                worker_thread_handle,
                ..
            } => worker_thread_handle.take(),
            _ => None,
        }
    }
}

fn router(server_state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(welcome_handler))
        .route("/process_image/", post(process_image_handler))
        .route("/process_json/", post(process_json_handler))
        .route("/stats", get(stats_handler))
        .route("/config/loglevel", post(config_loglevel_handler))
        .fallback(fallback_handler)
        .with_state(server_state)
        .layer(DefaultBodyLimit::max(THIRTY_MEGABYTES))
}

/// Serves until `cancellation_token` fires. Returns the detector worker thread
/// handle, if the detector came up, so the caller can join it.
pub async fn run_server(
    config: ServerConfig,
    recognizer: Arc<dyn PlateRecognizer>,
    cancellation_token: CancellationToken,
    detector_init_receiver: tokio::sync::oneshot::Receiver<InitResult>,
) -> anyhow::Result<Option<std::thread::JoinHandle<()>>> {
    let server_state = Arc::new(ServerState::new(&config, recognizer));

    let state_clone = server_state.clone();
    tokio::spawn(async move {
        let init_result = detector_init_receiver
            .await
            .map_err(|_| "Initialization channel dropped".to_string());
        state_clone.apply_init_result(init_result).await;
    });

    let plate_fusion = router(server_state.clone());

    let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.port);
    info!("Starting server, listening on {}", addr);
    info!("Status page, http://127.0.0.1:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!(
                "Looks like {} is already in use by another application, please turn off the \
                 other application or pick another port with --port",
                config.port
            );
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    axum::serve(listener, plate_fusion.into_make_service())
        .with_graceful_shutdown(async move { cancellation_token.cancelled().await })
        .await?;

    Ok(server_state.take_worker_thread_handle().await)
}

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate {
    metrics: Metrics,
}

async fn welcome_handler(State(server_state): State<Arc<ServerState>>) -> impl IntoResponse {
    let metrics = {
        let metrics_guard = server_state.metrics.lock().await;
        metrics_guard.clone()
    };
    let template = StatusTemplate { metrics };
    match template.render() {
        Ok(body) => (
            [
                (CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
                (axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8"),
            ],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Template error: {e}"),
        )
            .into_response(),
    }
}

/// Reads the `file` part of a multipart upload.
async fn read_file_field(
    mut multipart: Multipart,
) -> Result<(Option<String>, Bytes), PlateFusionError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(PlateFusionError::bad_request)?
    {
        if field.name() == Some("file") {
            let file_name = field.file_name().map(|s| s.to_string());
            let data = field.bytes().await.map_err(PlateFusionError::bad_request)?;
            return Ok((file_name, data));
        }
    }
    Err(PlateFusionError::bad_request(anyhow::anyhow!(
        "No file field found"
    )))
}

async fn process_image_handler(
    State(server_state): State<Arc<ServerState>>,
    multipart: Multipart, // Note multipart needs to be last
) -> Result<Json<ResultBundle>, PlateFusionError> {
    let request_start_time = Instant::now();
    let (file_name, data) = read_file_field(multipart).await?;
    let engine = server_state.engine().await?;

    let image = tokio::task::spawn_blocking(move || decode_image(file_name, &data))
        .await?
        .map_err(PlateFusionError::bad_request)?;

    match engine.process_image(image).await {
        Ok(bundle) => {
            server_state
                .metrics
                .lock()
                .await
                .record_image(&bundle, request_start_time.elapsed());
            Ok(Json(bundle))
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to process image");
            server_state.metrics.lock().await.record_failure();
            Err(err.into())
        }
    }
}

async fn process_json_handler(
    State(server_state): State<Arc<ServerState>>,
    multipart: Multipart,
) -> Result<Json<BatchResponse>, PlateFusionError> {
    let request_start_time = Instant::now();
    let (_, data) = read_file_field(multipart).await?;
    let entries = parse_entries(&data).map_err(PlateFusionError::bad_request)?;
    let engine = server_state.engine().await?;

    let response = run_batch(
        &engine,
        entries,
        server_state.batch_error_policy,
        server_state.batch_concurrency,
    )
    .await;
    server_state
        .metrics
        .lock()
        .await
        .record_batch(&response, request_start_time.elapsed());
    Ok(Json(response))
}

async fn stats_handler(State(server_state): State<Arc<ServerState>>) -> Json<StatsResponse> {
    Json(server_state.metrics.lock().await.stats())
}

#[derive(Deserialize)]
struct LogLevelRequest {
    log_level: crate::LogLevel,
}

async fn config_loglevel_handler(Json(payload): Json<LogLevelRequest>) -> impl IntoResponse {
    match crate::update_log_level(payload.log_level) {
        Ok(()) => {
            info!(?payload.log_level, "Log level updated successfully via API");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "success": true,
                    "message": format!("Log level updated to {:?}", payload.log_level),
                    "new_level": format!("{:?}", payload.log_level)
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to update log level: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "message": format!("Failed to update log level: {}", e)
                })),
            )
                .into_response()
        }
    }
}

async fn fallback_handler(req: Request<Body>) -> impl IntoResponse {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let body_bytes = body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_else(|_| body::Bytes::new());

    debug!(
        "Unimplemented endpoint called: Method: {}, URI: {}, Headers: {:?}, Body: {:?}",
        method, uri, headers, body_bytes
    );

    (StatusCode::NOT_FOUND, "Endpoint not implemented")
}

#[derive(Debug, Clone)]
pub struct Metrics {
    version: String,
    log_path: String,
    start_time: Instant,
    model_name: String,
    detector_backend: String,
    number_of_images: u128,
    failed_images: u128,
    batch_requests: u128,
    vehicles_detected: u128,
    vehicle_plates_read: u128,
    fallback_plates: u128,
    // Single image requests only, batch entries are not timed individually
    timed_images: u128,
    total_processing_ms: u128,
    min_processing_ms: u128,
    max_processing_ms: u128,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub version: String,
    pub model_name: String,
    pub detector_backend: String,
    pub uptime: String,
    pub number_of_images: u128,
    pub failed_images: u128,
    pub batch_requests: u128,
    pub vehicles_detected: u128,
    pub vehicle_plates_read: u128,
    pub fallback_plates: u128,
    pub avg_processing_ms: u128,
    pub min_processing_ms: u128,
    pub max_processing_ms: u128,
}

impl Metrics {
    pub fn new(model_name: String, log_path: Option<PathBuf>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            log_path: log_path
                .unwrap_or_else(|| PathBuf::from("stdout"))
                .to_string_lossy()
                .to_string(),
            start_time: Instant::now(),
            model_name,
            detector_backend: "Initializing...".to_string(),
            number_of_images: 0,
            failed_images: 0,
            batch_requests: 0,
            vehicles_detected: 0,
            vehicle_plates_read: 0,
            fallback_plates: 0,
            timed_images: 0,
            total_processing_ms: 0,
            min_processing_ms: 0,
            max_processing_ms: 0,
        }
    }

    fn uptime(&self) -> String {
        let elapsed = self.start_time.elapsed();
        let days = elapsed.as_secs() / 86400;
        let hours = (elapsed.as_secs() % 86400) / 3600;
        let minutes = (elapsed.as_secs() % 3600) / 60;
        format!("{days} days, {hours} hours and {minutes} minutes")
    }

    fn count_bundle(&mut self, bundle: &ResultBundle) {
        self.number_of_images = self.number_of_images.wrapping_add(1);
        self.vehicles_detected = self
            .vehicles_detected
            .wrapping_add(bundle.vehicles.len() as u128);
        self.vehicle_plates_read = self.vehicle_plates_read.wrapping_add(
            bundle.vehicles.iter().filter(|v| v.has_plate_text()).count() as u128,
        );
        self.fallback_plates = self
            .fallback_plates
            .wrapping_add(bundle.plates.len() as u128);
    }

    fn record_image(&mut self, bundle: &ResultBundle, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis();
        self.min_processing_ms = if self.timed_images == 0 {
            elapsed_ms
        } else {
            self.min_processing_ms.min(elapsed_ms)
        };
        self.max_processing_ms = self.max_processing_ms.max(elapsed_ms);
        self.total_processing_ms = self.total_processing_ms.wrapping_add(elapsed_ms);
        self.timed_images = self.timed_images.wrapping_add(1);
        self.count_bundle(bundle);
    }

    fn record_failure(&mut self) {
        self.failed_images = self.failed_images.wrapping_add(1);
    }

    fn record_batch(&mut self, response: &BatchResponse, elapsed: Duration) {
        self.batch_requests = self.batch_requests.wrapping_add(1);
        match response {
            BatchResponse::Entries(results) => {
                for result in results {
                    match &result.outcome {
                        crate::api::BatchOutcome::Processed(bundle) => self.count_bundle(bundle),
                        crate::api::BatchOutcome::Failed { .. } => self.record_failure(),
                    }
                }
            }
            BatchResponse::Failed(_) => self.record_failure(),
        }
        debug!(elapsed = ?elapsed, "Batch request done");
    }

    fn avg_processing_ms(&self) -> u128 {
        if self.timed_images == 0 {
            0
        } else {
            self.total_processing_ms / self.timed_images
        }
    }

    fn stats(&self) -> StatsResponse {
        StatsResponse {
            version: self.version.clone(),
            model_name: self.model_name.clone(),
            detector_backend: self.detector_backend.clone(),
            uptime: self.uptime(),
            number_of_images: self.number_of_images,
            failed_images: self.failed_images,
            batch_requests: self.batch_requests,
            vehicles_detected: self.vehicles_detected,
            vehicle_plates_read: self.vehicle_plates_read,
            fallback_plates: self.fallback_plates,
            avg_processing_ms: self.avg_processing_ms(),
            min_processing_ms: self.min_processing_ms,
            max_processing_ms: self.max_processing_ms,
        }
    }

    pub fn update_detector_info(&mut self, detector_info: &DetectorInfo) {
        self.model_name = detector_info.model_name.clone();
        self.detector_backend = format!("{:?}", detector_info.backend);
    }
}

/// Error returned from handlers, rendered as `{"error": "..."}`.
struct PlateFusionError {
    status: StatusCode,
    error: anyhow::Error,
}

impl PlateFusionError {
    fn with_status(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }

    fn bad_request(err: impl Into<anyhow::Error>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, err.into())
    }
}

impl IntoResponse for PlateFusionError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: format!("{:#}", self.error),
            }),
        )
            .into_response()
    }
}

impl<E> From<E> for PlateFusionError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, err.into())
    }
}
