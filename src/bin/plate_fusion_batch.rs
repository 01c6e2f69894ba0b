use anyhow::bail;
use clap::Parser;
use plate_fusion::{
    batch::{BatchResponse, OutputMode, parse_entries, run_batch, write_results},
    cli::Cli,
    detector::DetectorBackend,
    download_models::ensure_default_model,
    init_logging,
    pipeline::FusionEngine,
    recognizer::HttpPlateRecognizer,
    worker::DetectorWorker,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info};

/// Runs the fusion pipeline over a JSON list of image paths and writes the results to a JSON file
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// JSON array of {"filePath": ...} entries
    #[arg(long)]
    input: PathBuf,
    /// Where the results are written
    #[arg(long, default_value = "results.json")]
    output: PathBuf,
    /// Overwrite the output file or merge into it by filePath
    #[arg(long, value_enum, default_value_t = OutputMode::Overwrite)]
    output_mode: OutputMode,
    #[command(flatten)]
    service: Cli,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut service = match args.service.config.clone() {
        Some(config) => Cli::load_config(config)?,
        None => args.service,
    };
    let _guard = init_logging(service.log_level, &mut service.log_path)?;
    service.print_config();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    if service.detector == DetectorBackend::Onnx {
        service.model = Some(rt.block_on(ensure_default_model(service.model.as_deref()))?);
    }

    let entries = parse_entries(&std::fs::read(&args.input)?)?;
    info!(entries = entries.len(), input = %args.input.display(), "Loaded batch");

    // Detector loading blocks, keep it off the runtime
    let (handle, worker) =
        DetectorWorker::new(service.detector_config(), service.worker_queue_size)?;
    let worker_thread = worker.spawn_worker_thread();

    let recognizer = Arc::new(HttpPlateRecognizer::new(
        &service.recognizer_url,
        Duration::from_secs(service.recognizer_timeout),
    )?);
    let engine = FusionEngine::new(handle, recognizer, service.fusion_config());

    let response = rt.block_on(run_batch(
        &engine,
        entries,
        service.batch_error_policy,
        service.batch_concurrency,
    ));
    drop(engine);
    if worker_thread.join().is_err() {
        error!("Worker thread panicked");
    }

    write_results(&args.output, &response, args.output_mode)?;
    if let BatchResponse::Failed(failure) = response {
        bail!("Batch failed: {}", failure.error);
    }
    Ok(())
}
