//! Monitors the home sensors of a splitflap display.
//!
//! Requests the display state ten times per second and prints a timestamped line for every
//! module whose home sensor currently sees its magnet, until Ctrl+C.

use std::time::Duration;

use clap::Parser;
use splitflap::errors::Error;
use splitflap::hardware::{splitflap_context, SplitflapEvent};
use splitflap::io::{ask_for_serial_port, SplitflapState};

mod monitor;

#[derive(Parser, Debug)]
#[command(version, about = "Monitor the home sensors of a splitflap display", long_about = None)]
struct Args {
    /// Serial port of the splitflap (prompted for when absent)
    #[arg(short, long)]
    port: Option<String>,

    /// Delay between two state requests
    #[arg(long, value_name = "MS", default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    let port = match args.port {
        Some(port) => port,
        None => ask_for_serial_port()?,
    };

    let session = splitflap_context(port)?;
    session.on(SplitflapEvent::OnState, |state: SplitflapState| async move {
        monitor::monitor_home(&state)
    });

    monitor::run(
        &session,
        Duration::from_millis(args.interval_ms),
        tokio::signal::ctrl_c(),
    )
    .await?;
    session.close().await
}
