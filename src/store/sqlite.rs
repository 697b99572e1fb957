use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

use super::check_extends;
use crate::chain::{ChainHash, ChainId, SealedRecord};
use crate::error::{IntegrityError, Result};
use crate::tsa::TimestampToken;

pub const SEALED_RECORDS_SCHEMA: &str = include_str!("../../migrations/001_sealed_records.sql");

const SELECT_COLUMNS: &str = "sequence_number, previous_hash, current_hash, payload, signature, \
                              key_version, timestamp_token, sealed_at";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and run migrations. `sqlite::memory:` gets a single
    /// connection so every query sees the same database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite record store connected: {}", database_url);
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(SEALED_RECORDS_SCHEMA)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn append_batch(&self, chain: &ChainId, records: &[SealedRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let tip_row = sqlx::query(&format!(
            "SELECT {} FROM sealed_records WHERE chain_id = ? ORDER BY sequence_number DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(chain.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let tip = tip_row.as_ref().map(row_to_record).transpose()?;
        check_extends(chain, tip.as_ref(), records)?;

        for record in records {
            let token = record
                .timestamp_token
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            sqlx::query(
                r#"
                INSERT INTO sealed_records
                (chain_id, sequence_number, previous_hash, current_hash, payload, signature, key_version, timestamp_token, sealed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(chain.as_str())
            .bind(to_i64(record.sequence_number)?)
            .bind(record.previous_hash.to_hex())
            .bind(record.current_hash.to_hex())
            .bind(serde_json::to_string(&record.payload)?)
            .bind(&record.signature)
            .bind(i64::from(record.key_version))
            .bind(token)
            .bind(record.sealed_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                IntegrityError::ChainConflict(format!(
                    "{}: failed to insert record {}: {}",
                    chain, record.sequence_number, e
                ))
            })?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn range(&self, chain: &ChainId, from: u64, to: u64) -> Result<Vec<SealedRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sealed_records \
             WHERE chain_id = ? AND sequence_number >= ? AND sequence_number <= ? \
             ORDER BY sequence_number ASC",
            SELECT_COLUMNS
        ))
        .bind(chain.as_str())
        .bind(to_i64(from)?)
        .bind(to_i64(to.min(i64::MAX as u64))?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    pub async fn by_hash(&self, chain: &ChainId, hash: &ChainHash) -> Result<Option<SealedRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sealed_records WHERE chain_id = ? AND current_hash = ?",
            SELECT_COLUMNS
        ))
        .bind(chain.as_str())
        .bind(hash.to_hex())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    pub async fn tip(&self, chain: &ChainId) -> Result<Option<SealedRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sealed_records WHERE chain_id = ? ORDER BY sequence_number DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    pub async fn attach_timestamp(
        &self,
        chain: &ChainId,
        sequence_number: u64,
        token: &TimestampToken,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sealed_records
            SET timestamp_token = ?
            WHERE chain_id = ? AND sequence_number = ? AND timestamp_token IS NULL
            "#,
        )
        .bind(serde_json::to_string(token)?)
        .bind(chain.as_str())
        .bind(to_i64(sequence_number)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn chains(&self) -> Result<Vec<ChainId>> {
        let rows = sqlx::query("SELECT DISTINCT chain_id FROM sealed_records ORDER BY chain_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| ChainId::new(row.try_get::<String, _>("chain_id")?))
            .collect()
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| IntegrityError::store(format!("Sequence number {} out of range", value)))
}

fn row_to_record(row: &SqliteRow) -> Result<SealedRecord> {
    let sequence_number: i64 = row.try_get("sequence_number")?;
    let key_version: i64 = row.try_get("key_version")?;
    let token: Option<String> = row.try_get("timestamp_token")?;
    let sealed_at: String = row.try_get("sealed_at")?;

    Ok(SealedRecord {
        sequence_number: u64::try_from(sequence_number)
            .map_err(|_| IntegrityError::store("Negative sequence number"))?,
        payload: serde_json::from_str(&row.try_get::<String, _>("payload")?)?,
        previous_hash: row.try_get::<String, _>("previous_hash")?.parse()?,
        current_hash: row.try_get::<String, _>("current_hash")?.parse()?,
        signature: row.try_get("signature")?,
        key_version: u32::try_from(key_version)
            .map_err(|_| IntegrityError::store("Key version out of range"))?,
        timestamp_token: token.as_deref().map(serde_json::from_str).transpose()?,
        sealed_at: DateTime::parse_from_rfc3339(&sealed_at)
            .map_err(|e| IntegrityError::store(format!("Invalid sealed_at: {}", e)))?
            .with_timezone(&Utc),
    })
}
