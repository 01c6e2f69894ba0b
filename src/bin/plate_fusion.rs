use plate_fusion::{
    cli::Cli, detector::DetectorBackend, download_models::ensure_default_model, init_logging,
    plate_fusion_service,
};
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let mut args = Cli::from_config_and_args()?;
    let _guard = init_logging(args.log_level, &mut args.log_path)?;
    args.print_config();

    // Run the tokio runtime on the main thread
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if args.detector == DetectorBackend::Onnx {
        args.model = Some(rt.block_on(ensure_default_model(args.model.as_deref()))?);
    }

    let (plate_fusion_service_future, cancellation_token) = plate_fusion_service(args)?;

    let ctrl_c_token = cancellation_token.clone();
    rt.spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down server"),
            Err(err) => error!(%err, "Failed to listen for Ctrl+C, shutting down"),
        }
        ctrl_c_token.cancel();
    });

    let worker_handle = rt.block_on(plate_fusion_service_future)?;
    // The server and with it the last detector handle is gone, the worker exits on its own
    if let Some(handle) = worker_handle {
        info!("Waiting for worker thread to complete...");
        if let Err(e) = handle.join() {
            error!("Worker thread panicked: {:?}", e);
        }
    }
    info!("Server stopped");
    Ok(())
}
