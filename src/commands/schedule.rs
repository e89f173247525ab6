use crate::context::AppContext;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext, max_runs: Option<usize>) -> Result<()> {
    let scanner = app.scanner().await?;
    info!(
        "Scheduler started: scans run {} minutes after each close",
        scanner.settings().scan_delay_after_close.num_minutes()
    );
    let runs = scanner.orchestrator().run_daily(max_runs).await?;
    info!("Scheduler stopped after {} runs", runs.len());
    Ok(())
}
