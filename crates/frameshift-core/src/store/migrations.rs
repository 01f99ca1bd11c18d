//! Append-only schema migrations.
//!
//! `meta.version` records how many scripts have been applied; startup applies
//! every script at index >= version inside one transaction. Scripts are never
//! rewritten; schema changes append a new entry.

use anyhow::{Context, Result};
use sqlx::{Pool, Sqlite};

pub(crate) const MIGRATIONS: &[&str] = &[
    // 0: initial queue
    r#"
    CREATE TABLE jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        input_file TEXT NOT NULL,
        output_file TEXT,
        ffmpeg_command TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        progress REAL NOT NULL DEFAULT 0,
        queue_position INTEGER,
        total_frames INTEGER,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT,
        ended_at TEXT
    );
    "#,
    // 1: configuration snapshots and submission batches
    r#"
    ALTER TABLE jobs ADD COLUMN config_key TEXT;
    ALTER TABLE jobs ADD COLUMN config_json TEXT;
    CREATE TABLE config_blobs (
        key TEXT PRIMARY KEY,
        file_paths TEXT NOT NULL,
        config_json TEXT NOT NULL,
        picker_state TEXT,
        created_at TEXT NOT NULL
    );
    CREATE TABLE job_batches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        total_files INTEGER NOT NULL,
        created_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'in_progress',
        error_message TEXT,
        config_key TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    "#,
    // 2: retry/clear flags and listing indexes
    r#"
    ALTER TABLE jobs ADD COLUMN retried INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE jobs ADD COLUMN cleared INTEGER NOT NULL DEFAULT 0;
    CREATE INDEX idx_jobs_status ON jobs(status);
    CREATE INDEX idx_jobs_queue ON jobs(queue_position, created_at, id);
    CREATE INDEX idx_jobs_updated ON jobs(updated_at, id);
    "#,
    // 3: cluster claim bookkeeping
    r#"
    ALTER TABLE jobs ADD COLUMN assigned_worker TEXT;
    ALTER TABLE jobs ADD COLUMN worker_last_seen TEXT;
    "#,
];

/// Apply all pending migrations. Safe to call on every startup.
pub(crate) async fn apply_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    // The meta table is the migration marker itself, so it lives outside the list.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    let current: i64 = sqlx::query_scalar::<_, Option<String>>(
        "SELECT value FROM meta WHERE key = 'version'",
    )
    .fetch_optional(pool)
    .await?
    .flatten()
    .map(|v| v.parse::<i64>().unwrap_or(0))
    .unwrap_or(0);

    let total = MIGRATIONS.len() as i64;
    if current >= total {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for (idx, &script) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        sqlx::raw_sql(script)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("apply migration {}", idx))?;
    }
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES ('version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = ?1",
    )
    .bind(total.to_string())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!("applied migrations {}..{}", current, total);
    Ok(())
}
