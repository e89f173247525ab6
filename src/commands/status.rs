use crate::commands::print_json;
use crate::context::AppContext;
use anyhow::{anyhow, Result};

pub async fn run(app: &AppContext, run_id: &str) -> Result<()> {
    let scanner = app.scanner().await?;
    let status = scanner
        .orchestrator()
        .get_run_status(run_id)
        .await?
        .ok_or_else(|| anyhow!("Unknown run {}", run_id))?;
    print_json(&status)
}
