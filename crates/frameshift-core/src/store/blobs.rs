//! Configuration snapshots (content-addressed) and submission batches.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::Row;
use std::time::Duration;

use super::db::{now_utc, utc_before, Store};
use super::types::{normalize_timestamp, ConfigBlob, JobCreationBatch};

impl Store {
    /// Store a configuration snapshot. The key is the SHA-256 of the
    /// canonicalized payload, so identical submissions share one row and the
    /// table is naturally immutable (insert-or-ignore).
    pub async fn put_config_blob(
        &self,
        file_paths: &[String],
        config_json: &serde_json::Value,
        picker_state: Option<&serde_json::Value>,
    ) -> Result<String> {
        // serde_json maps are key-ordered, so this serialization is canonical.
        let canonical = serde_json::to_string(&serde_json::json!({
            "files": file_paths,
            "config": config_json,
        }))
        .context("canonicalize config snapshot")?;
        let key = hex::encode(Sha256::digest(canonical.as_bytes()));

        let files_json = serde_json::to_string(file_paths)?;
        let picker_json = picker_state.map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO config_blobs (key, file_paths, config_json, picker_state, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&key)
        .bind(files_json)
        .bind(config_json.to_string())
        .bind(picker_json)
        .bind(now_utc())
        .execute(&self.pool)
        .await?;

        Ok(key)
    }

    pub async fn get_config_blob(&self, key: &str) -> Result<Option<ConfigBlob>> {
        let row = sqlx::query(
            "SELECT key, file_paths, config_json, picker_state, created_at FROM config_blobs WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let file_paths: String = row.get("file_paths");
        let config_json: String = row.get("config_json");
        let picker_state: Option<String> = row.get("picker_state");

        Ok(Some(ConfigBlob {
            key: row.get("key"),
            file_paths: serde_json::from_str(&file_paths).context("decode stored file_paths")?,
            config_json: serde_json::from_str(&config_json).context("decode stored config_json")?,
            picker_state: picker_state
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("decode stored picker_state")?,
            created_at: normalize_timestamp(&row.get::<String, _>("created_at")),
        }))
    }

    /// Delete snapshots past the retention window that no job references.
    /// Returns the number of rows removed.
    pub async fn gc_config_blobs(&self, retention: Duration) -> Result<u64> {
        let cutoff = utc_before(retention);
        let r = sqlx::query(
            r#"
            DELETE FROM config_blobs
            WHERE created_at < ?1
              AND key NOT IN (SELECT config_key FROM jobs WHERE config_key IS NOT NULL)
            "#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }

    /// Open a bookkeeping row for a multi-file submission.
    pub async fn create_batch(&self, total_files: i64, config_key: Option<&str>) -> Result<i64> {
        let now = now_utc();
        let id = sqlx::query(
            r#"
            INSERT INTO job_batches (total_files, created_count, status, config_key, created_at, updated_at)
            VALUES (?1, 0, 'in_progress', ?2, ?3, ?3)
            "#,
        )
        .bind(total_files)
        .bind(config_key)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Bump the created counter as rows are inserted.
    pub async fn bump_batch_created(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE job_batches SET created_count = created_count + 1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now_utc())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a batch finished, with an error message when submission aborted.
    pub async fn finish_batch(&self, id: i64, error: Option<&str>) -> Result<()> {
        let status = if error.is_some() { "failed" } else { "completed" };
        sqlx::query(
            "UPDATE job_batches SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(status)
        .bind(error)
        .bind(now_utc())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_batch(&self, id: i64) -> Result<Option<JobCreationBatch>> {
        let row = sqlx::query(
            r#"
            SELECT id, total_files, created_count, status, error_message, config_key,
                   created_at, updated_at
            FROM job_batches WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| JobCreationBatch {
            id: row.get("id"),
            total_files: row.get("total_files"),
            created_count: row.get("created_count"),
            status: row.get("status"),
            error_message: row.get("error_message"),
            config_key: row.get("config_key"),
            created_at: normalize_timestamp(&row.get::<String, _>("created_at")),
            updated_at: normalize_timestamp(&row.get::<String, _>("updated_at")),
        }))
    }
}
