use crate::context::AppContext;
use crate::ingestion::IngestionOutcome;
use crate::models::AdminOverride;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{info, warn};

pub async fn run(
    app: &AppContext,
    symbol: &str,
    trading_day: Option<NaiveDate>,
    override_snapshot: bool,
    operator: Option<String>,
) -> Result<()> {
    let admin_override = match (override_snapshot, operator) {
        (true, Some(operator)) if !operator.trim().is_empty() => Some(AdminOverride { operator }),
        (true, _) => {
            return Err(anyhow!(
                "--override requires --operator so the new revision is attributable"
            ))
        }
        (false, _) => None,
    };

    let scanner = app.scanner().await?;
    let trading_day = scanner.orchestrator().resolve_trading_day(trading_day)?;
    let ingestion = scanner
        .orchestrator()
        .ingestion()
        .ingest_symbol(symbol, trading_day, admin_override.as_ref())
        .await?;

    match &ingestion.outcome {
        IngestionOutcome::Stored(record) => info!(
            "Stored {} {} revision {} ({}) after {} attempt(s)",
            ingestion.symbol,
            trading_day,
            record.revision,
            record.content_hash,
            ingestion.attempts
        ),
        IngestionOutcome::Reused(record) => info!(
            "{} {} already final at revision {}; pass --override to re-ingest",
            ingestion.symbol, trading_day, record.revision
        ),
        IngestionOutcome::Excluded(reason) => {
            warn!("{} {} excluded: {}", ingestion.symbol, trading_day, reason)
        }
    }
    if let Some(reason) = ingestion.exclusion() {
        if ingestion.record().is_some() {
            warn!("{} snapshot stored but not scannable: {}", ingestion.symbol, reason);
        }
    }
    Ok(())
}
