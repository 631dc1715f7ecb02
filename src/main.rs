mod auth;
mod config;
mod delivery;
mod form;
mod monitor;
mod session;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;

/// Exit status for an unusable config file.
const EXIT_CONFIG: u8 = 1;

#[derive(Parser)]
#[command(
    name = "tesladeliverydate",
    about = "Watch a vehicle reservation for delivery date changes"
)]
pub struct Args {
    #[arg(
        long,
        env = "TESLADELIVERYDATE_CONFIG",
        help = "Path to the JSON formatted config file [default: ~/.tesladeliverydate]"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        default_value = "60m",
        value_parser = config::parse_duration,
        help = "How often to check the delivery date (e.g. 90s, 15m, 1h30m)"
    )]
    pub refresh: Duration,

    #[arg(long, default_value = config::DEFAULT_HOST, help = "Account portal host")]
    pub host: String,

    #[arg(
        long,
        default_value = config::DEFAULT_ACCOUNT_PATH,
        help = "Account section path on the portal"
    )]
    pub account_path: String,

    #[arg(
        long,
        default_value = "info",
        help = "Log level filter, overridden by RUST_LOG"
    )]
    pub log_level: String,
}

fn load_settings(args: &Args) -> anyhow::Result<config::Settings> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let credentials = config::Credentials::load_from(&path)
        .with_context(|| format!("loading credentials from {}", path.display()))?;
    let endpoints = config::Endpoints::new(&args.host, &args.account_path);
    Ok(config::Settings::new(credentials, endpoints, args.refresh))
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = match load_settings(&args) {
        Ok(s) => s,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let connector = session::UreqConnector::new(&settings.user_agent, config::REQUEST_TIMEOUT);
    monitor::Monitor::new(
        &settings,
        connector,
        monitor::SystemClock,
        monitor::StdoutNotifier,
    )
    .run()
}
