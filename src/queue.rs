use crate::model::{Measurement, QueuedRecord, Record};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
// One writer plus one concurrent reader.
const MAX_CONNECTIONS: u32 = 2;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buffer (
    id TEXT PRIMARY KEY,
    station_id TEXT NOT NULL,
    station_name TEXT,
    device_id TEXT NOT NULL,
    device_name TEXT,
    device_group TEXT,
    timestamp TEXT NOT NULL,
    values_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    sent INTEGER DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_buffer_sent ON buffer(sent);
CREATE INDEX IF NOT EXISTS idx_buffer_created_at ON buffer(created_at);
"#;

#[derive(sqlx::FromRow)]
struct BufferRow {
    id: String,
    station_id: String,
    station_name: Option<String>,
    device_id: String,
    device_name: Option<String>,
    device_group: Option<String>,
    timestamp: String,
    values_json: String,
    created_at: String,
}

impl BufferRow {
    fn decode(self) -> Result<QueuedRecord> {
        let id = Uuid::parse_str(&self.id).with_context(|| format!("invalid id {}", self.id))?;
        let timestamp = parse_time(&self.timestamp).context("invalid timestamp")?;
        let created_at = parse_time(&self.created_at).context("invalid created_at")?;
        let measurements: Vec<Measurement> =
            serde_json::from_str(&self.values_json).context("invalid values_json")?;

        let record = Record::restore(
            id,
            self.station_id,
            self.station_name.unwrap_or_default(),
            timestamp,
            self.device_id,
            self.device_name.unwrap_or_default(),
            self.device_group.unwrap_or_default(),
            measurements,
        );
        Ok(QueuedRecord { record, created_at })
    }
}

/// SQLite-backed buffer of records whose live delivery failed.
#[derive(Clone)]
pub struct DurableQueue {
    pool: SqlitePool,
}

impl DurableQueue {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open queue database {}", path.display()))?;

        let queue = Self { pool };
        queue.migrate().await?;
        tracing::info!(path = %path.display(), "durable queue ready");
        Ok(queue)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to migrate queue schema")?;
        Ok(())
    }

    /// Queues `record`. Storing an id that is already present is a no-op.
    pub async fn store(&self, record: &Record) -> Result<()> {
        self.insert(record, Utc::now()).await
    }

    pub(crate) async fn insert(&self, record: &Record, created_at: DateTime<Utc>) -> Result<()> {
        let values_json = serde_json::to_string(record.measurements())?;
        sqlx::query(
            r#"
            INSERT INTO buffer (id, station_id, station_name, device_id, device_name, device_group,
                                timestamp, values_json, created_at, sent)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id().to_string())
        .bind(record.station_id())
        .bind(record.station_name())
        .bind(record.device_id())
        .bind(record.device_name())
        .bind(record.device_group())
        .bind(record.timestamp().to_rfc3339_opts(SecondsFormat::Nanos, true))
        .bind(values_json)
        .bind(created_at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .execute(&self.pool)
        .await
        .context("failed to store record")?;
        Ok(())
    }

    /// Oldest-first pending entries, at most `limit` of them.
    pub async fn get_pending(&self, limit: u32) -> Result<Vec<QueuedRecord>> {
        let rows: Vec<BufferRow> = sqlx::query_as(
            r#"
            SELECT id, station_id, station_name, device_id, device_name, device_group,
                   timestamp, values_json, created_at
            FROM buffer
            WHERE sent = 0
            ORDER BY julianday(created_at) ASC, rowid ASC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch pending records")?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.decode() {
                Ok(queued) => pending.push(queued),
                Err(err) => tracing::warn!(id = %id, error = %err, "skipping undecodable queue entry"),
            }
        }
        Ok(pending)
    }

    /// Removes acknowledged entries. Either every id is removed or none are.
    pub async fn mark_sent(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM buffer WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .context("failed to acknowledge record")?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Evicts every entry created more than `max_age` ago and returns how many were removed.
    pub async fn cleanup(&self, max_age: Duration) -> Result<u64> {
        let max_age = chrono::Duration::from_std(max_age).context("max age out of range")?;
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .context("max age out of range")?
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        // created_at may be whole-second or fractional RFC 3339; compare as instants.
        let result = sqlx::query("DELETE FROM buffer WHERE julianday(created_at) < julianday(?)")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to evict expired records")?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buffer WHERE sent = 0")
            .fetch_one(&self.pool)
            .await
            .context("failed to count pending records")?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
