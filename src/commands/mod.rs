pub mod cancel;
pub mod ingest;
pub mod results;
pub mod scan;
pub mod schedule;
pub mod status;

use anyhow::Result;
use serde::Serialize;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
