use clap::Args;
use std::time::Duration;

use editor_fleet_core::coordination::protocol::WorkerListResponse;
use editor_fleet_core::coordination::DEFAULT_MASTER_PORT;

use crate::error::CliError;
use crate::output;

/// Arguments for the workers command
#[derive(Args)]
pub struct WorkersArgs {
    /// Master surface port
    #[arg(short, long, default_value_t = DEFAULT_MASTER_PORT)]
    pub port: u16,

    /// Emit raw JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Execute the workers command
pub async fn execute(args: WorkersArgs, _verbose: bool) -> anyhow::Result<()> {
    let url = format!("http://127.0.0.1:{}/coordination/workers", args.port);
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| CliError::MasterUnreachable {
            port: args.port,
            suggestion: "start one with `editor-fleet run`".to_string(),
            source: Some(e.into()),
        })?;
    let listing: WorkerListResponse =
        response
            .json()
            .await
            .map_err(|e| CliError::ProtocolError {
                endpoint: url,
                message: e.to_string(),
            })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if listing.workers.is_empty() {
        println!("No workers registered.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<7} {:<8} {}",
        "INSTANCE", "WORKSPACE", "PORT", "STATUS", "LAST SEEN"
    );
    for worker in &listing.workers {
        println!(
            "{:<38} {:<20} {:<7} {:<8} {}",
            worker.instance_id,
            worker.workspace_name,
            worker.port,
            output::status_label(&worker.status.to_string()),
            worker.last_seen.format("%H:%M:%S"),
        );
    }

    Ok(())
}
