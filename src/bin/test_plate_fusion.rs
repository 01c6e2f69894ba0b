use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use plate_fusion::api::ResultBundle;
use reqwest::{Body, Client, multipart};
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};

// Simple test client to send multiple requests to a plate fusion service
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Origin for the requests
    #[clap(short, long, default_value = "http://127.0.0.1:8000")]
    origin: String,

    /// Image to post to /process_image/
    #[clap(short, long, conflicts_with = "json")]
    image: Option<PathBuf>,

    /// Batch file to post to /process_json/
    #[clap(short, long)]
    json: Option<PathBuf>,

    /// Number of requests to make
    #[clap(short, long, default_value_t = 1)]
    number_of_requests: u32,

    /// Interval in milliseconds for making requests
    #[clap(long, default_value_t = 1000)]
    interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (endpoint, file) = match (args.image.clone(), args.json.clone()) {
        (Some(image), _) => ("process_image/", image),
        (None, Some(json)) => ("process_json/", json),
        (None, None) => anyhow::bail!("Either --image or --json is required"),
    };
    let url = reqwest::Url::parse(&args.origin)?.join(endpoint)?;

    let pb = ProgressBar::new(args.number_of_requests as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    println!(
        "Calling {}, {} times with {} ms interval",
        url, args.number_of_requests, args.interval
    );

    let start_time = Instant::now();
    let mut futures = Vec::with_capacity(args.number_of_requests as usize);
    for i in 0..args.number_of_requests {
        futures.push(tokio::task::spawn(send_request(url.clone(), file.clone())));
        pb.inc(1);
        if i + 1 < args.number_of_requests {
            tokio::time::sleep(Duration::from_millis(args.interval)).await;
        }
    }
    let results = futures::future::join_all(futures).await;
    pb.finish_with_message("All requests completed!");
    let runtime_duration = start_time.elapsed();

    let mut request_times: Vec<Duration> = Vec::with_capacity(results.len());
    let mut last_response = None;
    for result in results {
        match result? {
            Ok((response, elapsed)) => {
                request_times.push(elapsed);
                last_response = Some(response);
            }
            Err(err) => println!("Request failed: {err:#}"),
        }
    }

    if let Some(response) = last_response {
        println!("{}", serde_json::to_string_pretty(&response)?);
        if let Ok(bundle) = serde_json::from_value::<ResultBundle>(response) {
            println!(
                "{} vehicles, {} with plate text, {} whole image plates",
                bundle.vehicles.len(),
                bundle.vehicles.iter().filter(|v| v.has_plate_text()).count(),
                bundle.plates.len()
            );
        }
    }

    println!("Runtime duration: {:?}", runtime_duration);
    match (request_times.iter().min(), request_times.iter().max()) {
        (Some(min_duration), Some(max_duration)) => {
            let avg_duration = request_times.iter().sum::<Duration>() / request_times.len() as u32;
            println!(
                "Request times -- min: {:?}, avg: {:?}, max: {:?}",
                min_duration, avg_duration, max_duration
            );
        }
        _ => println!("No request times to summarize"),
    }
    Ok(())
}

async fn send_request(
    url: reqwest::Url,
    file: PathBuf,
) -> anyhow::Result<(serde_json::Value, Duration)> {
    let client = Client::new();
    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let stream = FramedRead::new(File::open(&file).await?, BytesCodec::new());
    let part = multipart::Part::stream(Body::wrap_stream(stream)).file_name(file_name);
    let form = multipart::Form::new().part("file", part);

    let request_start_time = Instant::now();
    let response = client.post(url).multipart(form).send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        anyhow::bail!("{status}: {body}");
    }
    Ok((body, request_start_time.elapsed()))
}
