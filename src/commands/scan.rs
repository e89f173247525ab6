use crate::commands::print_json;
use crate::context::AppContext;
use crate::models::{AdminOverride, RunState};
use crate::orchestrator::TriggerRequest;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::info;

pub async fn run(
    app: &AppContext,
    symbols: Vec<String>,
    trading_day: Option<NaiveDate>,
    override_operator: Option<String>,
) -> Result<()> {
    let scanner = app.scanner().await?;
    let universe_override = if symbols.is_empty() {
        None
    } else {
        Some(symbols)
    };
    if universe_override.is_none() && scanner.settings().universe.is_empty() {
        return Err(anyhow!(
            "No symbols to scan. Set SCAN_UNIVERSE or pass symbols on the command line."
        ));
    }
    if let Some(operator) = override_operator.as_deref() {
        info!("Snapshot override authorized by {}", operator);
    }

    let status = scanner
        .orchestrator()
        .trigger_run(TriggerRequest {
            universe_override,
            admin_override: override_operator.map(|operator| AdminOverride { operator }),
            trading_day,
        })
        .await?;
    print_json(&status)?;
    if status.state != RunState::Committed {
        return Err(anyhow!(
            "Run {} ended {}: {}",
            status.run_id,
            status.state,
            status.error.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}
