use crate::context::AppContext;
use anyhow::Result;
use log::{info, warn};

pub async fn run(app: &AppContext, run_id: &str, operator: &str) -> Result<()> {
    let scanner = app.scanner().await?;
    if scanner.orchestrator().cancel_run(run_id, operator).await? {
        info!("Run {} cancelled by {}", run_id, operator);
    } else {
        warn!("Run {} already finished; nothing to cancel", run_id);
    }
    Ok(())
}
