pub mod cache;
pub mod calendar;
pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod errors;
pub mod http_source;
pub mod ingestion;
pub mod market_data;
pub mod memory_store;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod run_status;
pub mod scoring;
pub mod snapshot_store;
pub mod strategy;
pub mod validation;
