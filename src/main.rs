use clap::Parser;
use dlm::config::DownloadConfig;
use dlm::coordinator::DownloaderBuilder;
use dlm::error::DlmError;
use dlm::urls;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

mod args;
use args::Args;

#[tokio::main]
async fn main() {
    let args: Args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::filter::LevelFilter::INFO),
        )
        .init();

    // The process-exit decision lives here and nowhere else; the library
    // reports failure by returning an error.
    match run(args).await {
        Ok(()) => println!("Download succeeded."),
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Download failed.");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<(), DlmError> {
    let urls = urls::read_urls(&args.input).await?;
    let config = DownloadConfig::load_from_dir(std::env::current_dir()?)?;

    let downloader = DownloaderBuilder::default()
        .urls(urls)
        .max_connections(args.connections)
        .config(config)
        .build()?;

    downloader.run().await
}
