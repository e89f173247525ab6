use crate::models::{
    IngestionAuditRecord, RunState, RunStatus, ScanResult, SnapshotRecord, StrategyKind,
};
use crate::snapshot_store::{sort_results, SnapshotStore};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::NaiveDate;
use log::{debug, error};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");
const ENCRYPTION_PREFIX: &str = "enc:v1:";
const ENCRYPTION_IV_LENGTH: usize = 12;
const DATABASE_KEY_ENV_VAR: &str = "DATABASE_KEY";

/// PostgreSQL-backed snapshot store. Multi-row writes run in one transaction,
/// so the client sits behind a mutex.
pub struct Database {
    client: Mutex<Client>,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Creates missing tables. Every statement is `IF NOT EXISTS`.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.client
            .lock()
            .await
            .batch_execute(SCHEMA_SQL)
            .await
            .context("failed to apply schema")
    }

    pub async fn get_setting_value(&self, setting_key: &str) -> Result<Option<String>> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                "SELECT value FROM settings WHERE setting_key = $1",
                &[&setting_key],
            )
            .await?;
        row.map(|row| decrypt_database_value(&row.get::<_, String>(0)))
            .transpose()
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .lock()
            .await
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        let mut settings = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get(0);
            let raw_value: String = row.get(1);
            let value = decrypt_database_value(&raw_value)
                .with_context(|| format!("failed to decrypt setting {}", key))?;
            settings.insert(key, value);
        }
        Ok(settings)
    }
}

#[async_trait]
impl SnapshotStore for Database {
    async fn latest_snapshot(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
    ) -> Result<Option<SnapshotRecord>> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                "SELECT s.revision, s.content_hash, s.payload, c.payload, s.override_operator
                 FROM stock_snapshots s
                 JOIN option_chain_snapshots c
                   ON c.symbol = s.symbol AND c.trading_day = s.trading_day AND c.revision = s.revision
                 WHERE s.symbol = $1 AND s.trading_day = $2
                 ORDER BY s.revision DESC
                 LIMIT 1",
                &[&symbol, &trading_day],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let revision: i32 = row.get(0);
        let stock: Value = row.get(2);
        let chain: Value = row.get(3);
        Ok(Some(SnapshotRecord {
            revision: u32::try_from(revision)
                .map_err(|_| anyhow!("negative snapshot revision {}", revision))?,
            content_hash: row.get(1),
            stock: serde_json::from_value(stock)
                .with_context(|| format!("corrupt stock snapshot for {}", symbol))?,
            chain: serde_json::from_value(chain)
                .with_context(|| format!("corrupt option chain snapshot for {}", symbol))?,
            override_operator: row.get(4),
        }))
    }

    async fn append_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        let revision = i32::try_from(record.revision)
            .map_err(|_| anyhow!("snapshot revision {} out of range", record.revision))?;
        let stock = serde_json::to_value(&record.stock)?;
        let chain = serde_json::to_value(&record.chain)?;
        let symbol = record.symbol();
        let trading_day = record.trading_day();

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        // Plain INSERT: a second write of the same revision is a primary-key violation.
        tx.execute(
            "INSERT INTO stock_snapshots
                (symbol, trading_day, revision, content_hash, completeness_flag,
                 override_operator, captured_at, payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &symbol,
                &trading_day,
                &revision,
                &record.content_hash,
                &record.stock.completeness_flag,
                &record.override_operator,
                &record.stock.captured_at,
                &stock,
            ],
        )
        .await
        .with_context(|| {
            format!(
                "failed to insert stock snapshot {} {} revision {}",
                symbol, trading_day, record.revision
            )
        })?;
        tx.execute(
            "INSERT INTO option_chain_snapshots
                (symbol, trading_day, revision, completeness_flag, date_validation_passed,
                 options_trade_date, captured_at, payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &symbol,
                &trading_day,
                &revision,
                &record.chain.completeness_flag,
                &record.chain.date_validation_passed,
                &record.chain.options_trade_date,
                &record.chain.captured_at,
                &chain,
            ],
        )
        .await
        .with_context(|| format!("failed to insert option chain snapshot {} {}", symbol, trading_day))?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_ingestion_audit(&self, records: &[IngestionAuditRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let stmt = tx
            .prepare(
                "INSERT INTO ingestion_audit
                    (run_id, symbol, trading_day, outcome, reason_code, reason_detail,
                     attempts, revision, operator, recorded_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .await?;
        for record in records {
            let reason_code = record.reason.as_ref().map(|reason| reason.code());
            let reason_detail = record.reason.as_ref().map(|reason| reason.to_string());
            let attempts = i32::try_from(record.attempts).unwrap_or(i32::MAX);
            let revision = record
                .revision
                .map(|revision| i32::try_from(revision).unwrap_or(i32::MAX));
            tx.execute(
                &stmt,
                &[
                    &record.run_id,
                    &record.symbol,
                    &record.trading_day,
                    &record.outcome.as_str(),
                    &reason_code,
                    &reason_detail,
                    &attempts,
                    &revision,
                    &record.operator,
                    &record.recorded_at,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_run_status(&self, status: &RunStatus) -> Result<()> {
        let payload = serde_json::to_value(status)?;
        let updated = self
            .client
            .lock()
            .await
            .execute(
                "INSERT INTO scan_runs (run_id, state, trading_day, started_at, finished_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (run_id) DO UPDATE
                 SET state = EXCLUDED.state,
                     trading_day = EXCLUDED.trading_day,
                     finished_at = EXCLUDED.finished_at,
                     payload = EXCLUDED.payload
                 WHERE scan_runs.state <> 'COMMITTED'
                   AND (scan_runs.state <> 'FAILED' OR EXCLUDED.state = 'FAILED')",
                &[
                    &status.run_id,
                    &status.state.as_str(),
                    &status.trading_day,
                    &status.started_at,
                    &status.finished_at,
                    &payload,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(anyhow!(
                "Run {} is already terminal; refusing to record {}",
                status.run_id,
                status.state
            ));
        }
        Ok(())
    }

    async fn load_run_status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        let row = self
            .client
            .lock()
            .await
            .query_opt("SELECT payload FROM scan_runs WHERE run_id = $1", &[&run_id])
            .await?;
        row.map(|row| {
            serde_json::from_value::<RunStatus>(row.get(0))
                .with_context(|| format!("corrupt status for run {}", run_id))
        })
        .transpose()
    }

    async fn commit_run(&self, status: &RunStatus, results: &[ScanResult]) -> Result<()> {
        if status.state != RunState::Committed {
            return Err(anyhow!(
                "Run {} must be COMMITTED to commit, found {}",
                status.run_id,
                status.state
            ));
        }
        let payload = serde_json::to_value(status)?;

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let existing: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM scan_results WHERE run_id = $1",
                &[&status.run_id],
            )
            .await?
            .get(0);
        if existing > 0 {
            return Err(anyhow!("Results for run {} already written", status.run_id));
        }

        // Status and results share one transaction; readers see both or neither.
        let updated = tx
            .execute(
                "INSERT INTO scan_runs (run_id, state, trading_day, started_at, finished_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (run_id) DO UPDATE
                 SET state = EXCLUDED.state,
                     trading_day = EXCLUDED.trading_day,
                     finished_at = EXCLUDED.finished_at,
                     payload = EXCLUDED.payload
                 WHERE scan_runs.state NOT IN ('COMMITTED', 'FAILED')",
                &[
                    &status.run_id,
                    &status.state.as_str(),
                    &status.trading_day,
                    &status.started_at,
                    &status.finished_at,
                    &payload,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(anyhow!(
                "Run {} is already COMMITTED or FAILED; nothing committed",
                status.run_id
            ));
        }
        let stmt = tx
            .prepare(
                "INSERT INTO scan_results
                    (run_id, strategy, symbol, trading_day, final_score, base_score, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .await?;
        for result in results {
            if result.run_id != status.run_id {
                return Err(anyhow!(
                    "Result for {} belongs to run {}, not {}",
                    result.symbol,
                    result.run_id,
                    status.run_id
                ));
            }
            let result_payload = serde_json::to_value(result)?;
            tx.execute(
                &stmt,
                &[
                    &result.run_id,
                    &result.strategy.as_str(),
                    &result.symbol,
                    &result.trading_day,
                    &result.final_score,
                    &result.base_score,
                    &result_payload,
                ],
            )
            .await
            .with_context(|| {
                format!(
                    "failed to insert {} result for {} in run {}",
                    result.strategy, result.symbol, result.run_id
                )
            })?;
        }

        tx.commit().await?;
        debug!("Committed {} results for run {}", results.len(), status.run_id);
        Ok(())
    }

    async fn latest_committed_run(&self) -> Result<Option<RunStatus>> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                "SELECT payload FROM scan_runs
                 WHERE state = 'COMMITTED'
                 ORDER BY finished_at DESC NULLS LAST, run_id DESC
                 LIMIT 1",
                &[],
            )
            .await?;
        row.map(|row| {
            serde_json::from_value::<RunStatus>(row.get(0)).context("corrupt committed run status")
        })
        .transpose()
    }

    async fn load_results(&self, run_id: &str, strategy: StrategyKind) -> Result<Vec<ScanResult>> {
        let rows = self
            .client
            .lock()
            .await
            .query(
                "SELECT payload FROM scan_results
                 WHERE run_id = $1 AND strategy = $2
                 ORDER BY final_score DESC, symbol ASC",
                &[&run_id, &strategy.as_str()],
            )
            .await?;
        let mut results = rows
            .into_iter()
            .map(|row| {
                serde_json::from_value::<ScanResult>(row.get(0))
                    .with_context(|| format!("corrupt {} result in run {}", strategy, run_id))
            })
            .collect::<Result<Vec<_>>>()?;
        sort_results(&mut results);
        Ok(results)
    }
}

fn decrypt_database_value(value: &str) -> Result<String> {
    if value.is_empty() || !value.starts_with(ENCRYPTION_PREFIX) {
        return Ok(value.to_string());
    }

    let key = load_database_key()?;
    let payload = value
        .strip_prefix(ENCRYPTION_PREFIX)
        .ok_or_else(|| anyhow!("Encrypted value has an invalid format."))?;
    let parts: Vec<&str> = payload.split(':').collect();
    if parts.len() != 3 {
        return Err(anyhow!("Encrypted value has an invalid format."));
    }

    let iv = BASE64_STANDARD
        .decode(parts[0])
        .map_err(|_| anyhow!("Encrypted value payload is invalid."))?;
    let data = BASE64_STANDARD
        .decode(parts[1])
        .map_err(|_| anyhow!("Encrypted value payload is invalid."))?;
    let tag = BASE64_STANDARD
        .decode(parts[2])
        .map_err(|_| anyhow!("Encrypted value payload is invalid."))?;

    if iv.len() != ENCRYPTION_IV_LENGTH || tag.is_empty() {
        return Err(anyhow!("Encrypted value payload is invalid."));
    }

    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow!("Failed to initialize cipher."))?;
    let nonce = Nonce::from_slice(&iv);
    let mut encrypted = Vec::with_capacity(data.len() + tag.len());
    encrypted.extend_from_slice(&data);
    encrypted.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(nonce, encrypted.as_ref())
        .map_err(|_| anyhow!("Failed to decrypt encrypted value."))?;

    String::from_utf8(plaintext).context("Decrypted value is not valid UTF-8.")
}

fn load_database_key() -> Result<[u8; 32]> {
    let raw = std::env::var(DATABASE_KEY_ENV_VAR).unwrap_or_default();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!(
            "{} is required to decrypt secret settings such as MARKET_DATA_API_KEY.",
            DATABASE_KEY_ENV_VAR
        ));
    }

    if trimmed.len() == 64 && trimmed.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        let decoded = hex::decode(trimmed).map_err(|_| invalid_database_key_error(0))?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|decoded: Vec<u8>| invalid_database_key_error(decoded.len()))?;
        return Ok(key);
    }

    let decoded = BASE64_STANDARD.decode(trimmed).unwrap_or_default();
    let key: [u8; 32] = decoded
        .try_into()
        .map_err(|decoded: Vec<u8>| invalid_database_key_error(decoded.len()))?;
    Ok(key)
}

fn invalid_database_key_error(key_length: usize) -> anyhow::Error {
    anyhow!(
        "{} must be a 32-byte key encoded as 64 hex characters or base64. Key length {}",
        DATABASE_KEY_ENV_VAR,
        key_length
    )
}
