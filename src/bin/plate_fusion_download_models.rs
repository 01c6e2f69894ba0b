use clap::{CommandFactory, Parser};
use plate_fusion::download_models::{Model, default_model_dir, download_model, list_models};
use plate_fusion::{LogLevel, init_logging};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "plate_fusion_download_models",
    about = "A tool to download vehicle detection models for Plate Fusion"
)]
struct Cli {
    /// The name of the model to download (optional)
    #[clap(short, long, conflicts_with_all = &["all", "yolo5", "rt_detrv2", "list_models"])]
    model: Option<String>,

    /// Download all models
    #[clap(short, long, conflicts_with_all = &["model", "yolo5", "rt_detrv2", "list_models"])]
    all: bool,

    /// Download the YOLO5 models
    #[clap(long, conflicts_with_all = &["model", "all", "rt_detrv2", "list_models"])]
    yolo5: bool,

    /// Download the RT-DETRv2 models
    #[clap(long, conflicts_with_all = &["model", "all", "yolo5", "list_models"])]
    rt_detrv2: bool,

    /// List all available models
    #[clap(long, conflicts_with_all = &["model", "all", "yolo5", "rt_detrv2", "destination"])]
    list_models: bool,

    /// Optional destination path where the models will be downloaded
    #[clap(short, long)]
    destination: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(LogLevel::Info, &mut None)?;

    let model_path = cli.destination.unwrap_or_else(default_model_dir);

    let model = if cli.list_models {
        list_models();
        return Ok(());
    } else if cli.all {
        Model::All
    } else if cli.yolo5 {
        Model::AllYolo5
    } else if cli.rt_detrv2 {
        Model::AllRtDetr2
    } else if let Some(name) = cli.model {
        Model::Model(name)
    } else {
        Cli::command().print_help()?;
        return Ok(());
    };
    download_model(model_path, model).await
}
