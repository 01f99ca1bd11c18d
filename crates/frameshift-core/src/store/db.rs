//! SQLite-backed store handle: pool setup, row mapping, meta access.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::Duration;

use super::migrations;
use super::types::{normalize_timestamp, EncoderCommand, Job, JobStatus};

/// Handle to the SQLite-backed job store.
///
/// The database file lives under the service data dir (`data/frameshift.db`
/// by default) with WAL journaling; every write is a transaction.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: Pool<Sqlite>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("open job database {}", path.display()))?;

        let store = Store { pool };
        migrations::apply_migrations(&store.pool).await?;
        Ok(store)
    }

    /// Open an in-memory database (tests and ephemeral tooling).
    /// Single connection so the pool never hands back a different empty DB.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Store { pool };
        migrations::apply_migrations(&store.pool).await?;
        Ok(store)
    }

    /// Close the pool, flushing WAL state. Called once during shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Read a meta value.
    pub async fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Upsert a meta value.
    pub async fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Current UTC time in the stored `YYYY-MM-DD HH:MM:SS` format.
pub(crate) fn now_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// UTC time `offset` in the past, in the stored format. Used for stale cutoffs.
pub(crate) fn utc_before(offset: Duration) -> String {
    let delta = chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
    (chrono::Utc::now() - delta).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) const JOB_COLUMNS: &str = "id, name, input_file, output_file, ffmpeg_command, status, \
     progress, queue_position, total_frames, error_message, created_at, updated_at, started_at, \
     ended_at, config_key, config_json, retried, cleared, assigned_worker, worker_last_seen";

/// Map one `jobs` row, normalizing timestamps to ISO-8601 UTC.
pub(crate) fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let command_json: String = row.get("ffmpeg_command");
    let command: EncoderCommand =
        serde_json::from_str(&command_json).context("decode stored ffmpeg_command")?;

    let config_json: Option<String> = row.get("config_json");
    let config_json = config_json
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("decode stored config_json")?;

    let status: String = row.get("status");
    let opt_ts = |v: Option<String>| v.map(|s| normalize_timestamp(&s));

    Ok(Job {
        id: row.get("id"),
        name: row.get("name"),
        input_file: row.get("input_file"),
        output_file: row.get("output_file"),
        ffmpeg_command: command,
        status: JobStatus::parse(&status),
        progress: row.get("progress"),
        queue_position: row.get("queue_position"),
        total_frames: row.get("total_frames"),
        error_message: row.get("error_message"),
        created_at: normalize_timestamp(&row.get::<String, _>("created_at")),
        updated_at: normalize_timestamp(&row.get::<String, _>("updated_at")),
        started_at: opt_ts(row.get("started_at")),
        ended_at: opt_ts(row.get("ended_at")),
        config_key: row.get("config_key"),
        config_json,
        retried: row.get::<i64, _>("retried") != 0,
        cleared: row.get::<i64, _>("cleared") != 0,
        assigned_worker: row.get("assigned_worker"),
        worker_last_seen: opt_ts(row.get("worker_last_seen")),
    })
}
