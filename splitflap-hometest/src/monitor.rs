use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use splitflap::errors::Error;
use splitflap::hardware::Splitflap;
use splitflap::io::SplitflapState;

/// One line per module with an active home sensor, in module order.
pub fn home_events(timestamp: f64, state: &SplitflapState) -> Vec<String> {
    state
        .modules
        .iter()
        .enumerate()
        .filter(|(_, module)| module.sensor_state)
        .map(|(i, module)| {
            format!(
                "[{:.3}] Module {}: HOME detected at flap {}",
                timestamp, i, module.flap_index
            )
        })
        .collect()
}

/// State handler: prints the home events of `state`, stamped with the current time.
pub fn monitor_home(state: &SplitflapState) {
    let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;
    for line in home_events(timestamp, state) {
        println!("{}", line);
    }
}

/// Requests the state every `interval` until `shutdown` resolves.
///
/// # Errors
/// A request the session refuses (closed connection...) ends the loop.
pub async fn run<F: Future>(
    session: &Splitflap,
    interval: Duration,
    shutdown: F,
) -> Result<(), Error> {
    println!("Monitoring home sensors. Press Ctrl+C to exit.");

    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Monitoring stopped");
                return Ok(());
            }
            _ = ticker.tick() => session.request_state()?,
        }
    }
}
