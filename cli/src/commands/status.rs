use clap::Args;
use std::time::Duration;

use editor_fleet_core::coordination::protocol::{CoordinationHealth, CoordinationStatus};
use editor_fleet_core::coordination::DEFAULT_MASTER_PORT;

use crate::error::CliError;
use crate::output;

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Master surface port
    #[arg(short, long, default_value_t = DEFAULT_MASTER_PORT)]
    pub port: u16,

    /// Emit raw JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

/// Execute the status command
pub async fn execute(args: StatusArgs, verbose: bool) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", args.port);

    let health: CoordinationHealth = fetch(&client, &format!("{base}/coordination/health"), args.port).await?;
    let status: CoordinationStatus = fetch(&client, &format!("{base}/coordination/status"), args.port).await?;

    if args.json {
        let combined = serde_json::json!({ "health": health, "status": status });
        println!("{}", serde_json::to_string_pretty(&combined)?);
        return Ok(());
    }

    output::heading("Master");
    output::field("status", output::status_label(&health.status));
    output::field("instance", &health.instance_id);
    output::field("version", &health.version);
    output::field("uptime", output::format_millis(health.uptime_ms));
    output::field("workers", health.worker_count);

    println!();
    output::heading("Tool calls");
    output::field("total", status.metrics.total_calls);
    output::field(
        "success rate",
        format!("{:.1}%", status.metrics.success_rate * 100.0),
    );
    output::field(
        "avg response",
        format!("{:.1}ms", status.metrics.avg_response_ms),
    );

    if verbose && !status.history.is_empty() {
        println!();
        output::heading("Recent calls");
        for entry in status.history.iter().rev().take(10) {
            let target = entry.routed_to.as_deref().unwrap_or("-");
            let outcome = if entry.error.is_none() { "ok" } else { "err" };
            println!(
                "  {:<28} {:<10} {:>7} {}",
                entry.tool,
                target,
                output::format_millis(entry.duration_ms),
                output::status_label(if outcome == "ok" { "healthy" } else { "failed" }),
            );
        }
    }

    Ok(())
}

async fn fetch<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    port: u16,
) -> Result<T, CliError> {
    let response = client
        .get(url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| CliError::MasterUnreachable {
            port,
            suggestion: "start one with `editor-fleet run`".to_string(),
            source: Some(e.into()),
        })?;
    response.json::<T>().await.map_err(|e| CliError::ProtocolError {
        endpoint: url.to_string(),
        message: e.to_string(),
    })
}
