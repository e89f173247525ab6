use crate::commands::print_json;
use crate::config::parse_symbol_list;
use crate::context::AppContext;
use crate::models::StrategyKind;
use crate::snapshot_store::ResultQuery;
use anyhow::Result;
use log::{info, warn};

pub async fn run(
    app: &AppContext,
    strategy: &str,
    run_id: Option<String>,
    min_score: Option<f64>,
    symbols: Vec<String>,
    limit: Option<usize>,
) -> Result<()> {
    let scanner = app.scanner().await?;
    let query = ResultQuery {
        run_id,
        strategy: StrategyKind::parse(strategy)?,
        min_score,
        symbols: if symbols.is_empty() {
            None
        } else {
            Some(parse_symbol_list(&symbols.join(",")))
        },
        limit,
    };
    let page = scanner.cache().query(&query).await?;
    match (&page.run_id, page.trading_day) {
        (Some(run_id), Some(trading_day)) => info!(
            "{} {} results from run {} (trading day {})",
            page.results.len(),
            page.strategy,
            run_id,
            trading_day
        ),
        _ => warn!("No committed run yet"),
    }
    print_json(&page)
}
