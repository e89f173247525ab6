use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use screener::{
    commands::{cancel, ingest, results, scan, schedule, status},
    context::AppContext,
};
use std::env;

#[derive(Parser)]
#[command(name = "screener")]
#[command(about = "End-of-day covered call and PMCC screener")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest, validate, select and score the universe, then commit one run
    Scan {
        /// Symbols to scan instead of SCAN_UNIVERSE
        #[arg(value_delimiter = ',', num_args = 0..)]
        symbols: Vec<String>,
        /// Trading day to scan (defaults to the most recent closed session)
        #[arg(long, value_name = "YYYY-MM-DD")]
        trading_day: Option<NaiveDate>,
        /// Re-ingest final snapshots as a new revision, attributed to this operator
        #[arg(long = "override-operator", value_name = "NAME")]
        override_operator: Option<String>,
    },
    /// Show the status of a run
    Status {
        run_id: String,
    },
    /// Print results of the latest committed run, or of a given run
    Results {
        /// covered_call or pmcc
        #[arg(long, default_value = "covered_call")]
        strategy: String,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Ingest one symbol's end-of-day snapshot
    Ingest {
        symbol: String,
        #[arg(long, value_name = "YYYY-MM-DD")]
        trading_day: Option<NaiveDate>,
        /// Append a new revision even if the snapshot is already final
        #[arg(long = "override")]
        override_snapshot: bool,
        /// Operator authorizing the override
        #[arg(long)]
        operator: Option<String>,
    },
    /// Mark a run FAILED at its next stage boundary
    Cancel {
        run_id: String,
        #[arg(long, default_value = "cli")]
        operator: String,
    },
    /// Scan after every close until stopped
    Schedule {
        /// Stop after this many runs
        #[arg(long)]
        max_runs: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let app_context = AppContext::initialize(env::var("DATABASE_URL").ok()).await?;

    info!("Starting screener. Not financial advice. Options trading involves substantial risk.");

    match command {
        Commands::Scan {
            symbols,
            trading_day,
            override_operator,
        } => {
            scan::run(&app_context, symbols, trading_day, override_operator).await?;
        }
        Commands::Status { run_id } => {
            status::run(&app_context, &run_id).await?;
        }
        Commands::Results {
            strategy,
            run_id,
            min_score,
            symbols,
            limit,
        } => {
            results::run(&app_context, &strategy, run_id, min_score, symbols, limit).await?;
        }
        Commands::Ingest {
            symbol,
            trading_day,
            override_snapshot,
            operator,
        } => {
            ingest::run(&app_context, &symbol, trading_day, override_snapshot, operator).await?;
        }
        Commands::Cancel { run_id, operator } => {
            cancel::run(&app_context, &run_id, &operator).await?;
        }
        Commands::Schedule { max_runs } => {
            schedule::run(&app_context, max_runs).await?;
        }
    }

    Ok(())
}
