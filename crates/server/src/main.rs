//! VoxSentinel service entry point.

mod api_client;
mod app;
mod health;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use voxsentinel_common::Settings;

#[derive(Debug, Parser)]
#[command(name = "voxsentinel", about = "Live audio monitoring pipeline")]
struct Args {
    /// Path to a config file layered under environment overrides.
    #[arg(short, long)]
    config: Option<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,voxsentinel=debug"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let settings = match Settings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };

    init_tracing(settings.log_json);

    if let Err(err) = app::run(settings).await {
        tracing::error!(error = %format!("{err:#}"), "fatal startup error");
        std::process::exit(1);
    }
}
