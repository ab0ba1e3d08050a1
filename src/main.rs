/// Relayflow daemon
///
/// Loads active workflows from SQLite and runs the timer-triggered ones on
/// their schedules until interrupted.

use relayflow::{config::Config, daemon::run_daemon};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults, overridable through RELAYFLOW_* environment variables
    let config = Config::default();

    run_daemon(config).await
}
