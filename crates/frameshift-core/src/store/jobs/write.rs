//! Job write operations: insert, patch, claim, heartbeat, recovery, bulk actions.

use anyhow::{Context, Result};
use sqlx::Row;
use std::time::Duration;

use super::super::db::{job_from_row, now_utc, utc_before, Store, JOB_COLUMNS};
use super::super::types::{Job, JobId, JobPatch, JobStatus, NewJob};

/// Error recorded when a stale heartbeat releases a processing row.
pub const STALE_WORKER_ERROR: &str = "Worker became unresponsive";

impl Store {
    /// Insert a new pending job. Queue position is the caller's choice
    /// (submission appends to the tail, dispatch bookkeeping may leave it NULL).
    pub async fn create_job(&self, new: &NewJob) -> Result<JobId> {
        let now = now_utc();
        let command_json =
            serde_json::to_string(&new.command).context("serialize ffmpeg_command")?;
        let config_json = new
            .config_json
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize config snapshot")?;

        let id = sqlx::query(
            r#"
            INSERT INTO jobs (
                name, input_file, output_file, ffmpeg_command, status, progress,
                queue_position, total_frames, created_at, updated_at,
                config_key, config_json
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?7, ?8, ?9)
            "#,
        )
        .bind(&new.name)
        .bind(&new.input_file)
        .bind(&new.output_file)
        .bind(command_json)
        .bind(new.queue_position)
        .bind(new.total_frames)
        .bind(&now)
        .bind(&new.config_key)
        .bind(config_json)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    /// Partial update; always bumps `updated_at`.
    pub async fn update_job(&self, id: JobId, patch: &JobPatch) -> Result<()> {
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new("UPDATE jobs SET updated_at = ");
        qb.push_bind(now_utc());

        if let Some(status) = patch.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(progress) = patch.progress {
            qb.push(", progress = ").push_bind(progress);
        }
        if let Some(ref v) = patch.output_file {
            qb.push(", output_file = ").push_bind(v.clone());
        }
        if let Some(ref v) = patch.error_message {
            qb.push(", error_message = ").push_bind(v.clone());
        }
        if let Some(ref v) = patch.started_at {
            qb.push(", started_at = ").push_bind(v.clone());
        }
        if let Some(ref v) = patch.ended_at {
            qb.push(", ended_at = ").push_bind(v.clone());
        }
        if let Some(ref v) = patch.total_frames {
            qb.push(", total_frames = ").push_bind(*v);
        }
        if let Some(ref v) = patch.queue_position {
            qb.push(", queue_position = ").push_bind(*v);
        }
        if let Some(ref v) = patch.assigned_worker {
            qb.push(", assigned_worker = ").push_bind(v.clone());
        }
        if let Some(ref v) = patch.worker_last_seen {
            qb.push(", worker_last_seen = ").push_bind(v.clone());
        }
        if let Some(retried) = patch.retried {
            qb.push(", retried = ").push_bind(retried as i64);
        }
        if let Some(cleared) = patch.cleared {
            qb.push(", cleared = ").push_bind(cleared as i64);
        }

        qb.push(" WHERE id = ").push_bind(id);
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Atomically claim the oldest unclaimed pending job for `worker_id`:
    /// inside one transaction the candidate is selected in queue order and
    /// moved to `processing` only if it is still pending and unclaimed.
    /// Concurrent claimers receive disjoint rows; a lost race retries until
    /// the queue is drained.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        self.claim_next_inner(Some(worker_id)).await
    }

    /// Leader variant: same transition without recording `assigned_worker`
    /// (the dispatcher records the follower assignment once one is acquired).
    pub async fn claim_next_unassigned(&self) -> Result<Option<Job>> {
        self.claim_next_inner(None).await
    }

    async fn claim_next_inner(&self, worker_id: Option<&str>) -> Result<Option<Job>> {
        loop {
            let now = now_utc();
            let mut tx = self.pool.begin().await?;

            let candidate = sqlx::query(
                r#"
                SELECT id FROM jobs
                WHERE status = 'pending' AND assigned_worker IS NULL
                ORDER BY queue_position ASC NULLS LAST, created_at ASC, id ASC
                LIMIT 1
                "#,
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = candidate else {
                tx.commit().await?;
                return Ok(None);
            };
            let id: i64 = row.get("id");

            let updated = match worker_id {
                Some(worker) => {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'processing',
                            assigned_worker = ?1,
                            started_at = ?2,
                            worker_last_seen = ?2,
                            updated_at = ?2,
                            error_message = NULL
                        WHERE id = ?3 AND status = 'pending' AND assigned_worker IS NULL
                        "#,
                    )
                    .bind(worker)
                    .bind(&now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                }
                None => {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'processing',
                            started_at = ?1,
                            updated_at = ?1,
                            error_message = NULL
                        WHERE id = ?2 AND status = 'pending' AND assigned_worker IS NULL
                        "#,
                    )
                    .bind(&now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                }
            };

            if updated.rows_affected() != 1 {
                // Lost the race for this row; another claimer won it. Try the next.
                tx.commit().await?;
                continue;
            }

            let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            let job = job_from_row(&row)?;
            tx.commit().await?;
            return Ok(Some(job));
        }
    }

    /// Progress write from the executor stream; refreshes the worker heartbeat.
    pub async fn update_progress(&self, id: JobId, progress: f64) -> Result<()> {
        let now = now_utc();
        sqlx::query(
            r#"
            UPDATE jobs
            SET progress = ?1,
                worker_last_seen = ?2,
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(progress.clamp(0.0, 100.0))
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Heartbeat for a claimed row. No-op if the row is owned by another worker.
    pub async fn update_worker_heartbeat(&self, id: JobId, worker_id: &str) -> Result<()> {
        let now = now_utc();
        sqlx::query(
            r#"
            UPDATE jobs
            SET worker_last_seen = ?1,
                updated_at = ?1
            WHERE id = ?2 AND assigned_worker = ?3
            "#,
        )
        .bind(&now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a successful encode: completed, progress 100, output path set.
    pub async fn complete_job(
        &self,
        id: JobId,
        output_file: &str,
        total_frames: Option<i64>,
    ) -> Result<()> {
        let now = now_utc();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                progress = 100,
                output_file = ?1,
                total_frames = COALESCE(?2, total_frames),
                error_message = NULL,
                assigned_worker = NULL,
                ended_at = ?3,
                updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(output_file)
        .bind(total_frames)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed encode with its error message.
    pub async fn fail_job(&self, id: JobId, error: &str) -> Result<()> {
        let now = now_utc();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error_message = ?1,
                assigned_worker = NULL,
                ended_at = ?2,
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal cancellation (user action observed by the processor, or a
    /// pending row cancelled directly).
    pub async fn cancel_job(&self, id: JobId, message: &str) -> Result<()> {
        let now = now_utc();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_message = ?1,
                assigned_worker = NULL,
                ended_at = ?2,
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(message)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Return a claimed-but-undispatchable row to the queue (leader could not
    /// place it on any follower). Not an error; the row keeps its position.
    pub async fn revert_to_pending(&self, id: JobId) -> Result<()> {
        let now = now_utc();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                progress = 0,
                started_at = NULL,
                assigned_worker = NULL,
                worker_last_seen = NULL,
                updated_at = ?1
            WHERE id = ?2 AND status = 'processing'
            "#,
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record which follower a dispatched job landed on (leader mode).
    pub async fn assign_worker(&self, id: JobId, worker_id: &str) -> Result<()> {
        let now = now_utc();
        sqlx::query(
            r#"
            UPDATE jobs
            SET assigned_worker = ?1,
                worker_last_seen = ?2,
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(worker_id)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Release every processing row whose heartbeat is older than `timeout`:
    /// the worker is presumed gone, the row fails with [`STALE_WORKER_ERROR`].
    /// Returns the number of rows released.
    pub async fn release_stale_jobs(&self, timeout: Duration) -> Result<u64> {
        let now = now_utc();
        let cutoff = utc_before(timeout);
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error_message = ?1,
                assigned_worker = NULL,
                ended_at = ?2,
                updated_at = ?2
            WHERE status = 'processing'
              AND worker_last_seen IS NOT NULL
              AND worker_last_seen < ?3
            "#,
        )
        .bind(STALE_WORKER_ERROR)
        .bind(&now)
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }

    /// Startup-only crash recovery: any row left in `processing` reverts to
    /// `pending` with progress zeroed. Returns the number of rows reset.
    pub async fn reset_processing_jobs(&self) -> Result<u64> {
        let now = now_utc();
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                progress = 0,
                started_at = NULL,
                assigned_worker = NULL,
                worker_last_seen = NULL,
                updated_at = ?1
            WHERE status = 'processing'
            "#,
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }

    /// Cancel every pending row (bulk cancel). Processing rows are the
    /// processor's to cancel. Returns the ids that were transitioned.
    pub async fn cancel_pending_jobs(&self) -> Result<Vec<JobId>> {
        let now = now_utc();
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_message = 'cancelled by user',
                ended_at = ?1,
                updated_at = ?1
            WHERE status = 'pending'
            RETURNING id
            "#,
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    /// Hide completed rows from the default listing.
    pub async fn clear_successful_jobs(&self) -> Result<u64> {
        let now = now_utc();
        let r = sqlx::query(
            "UPDATE jobs SET cleared = 1, updated_at = ?1 WHERE status = 'completed' AND cleared = 0",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }

    /// Hide all finished rows (completed, failed, cancelled) from the default listing.
    pub async fn clear_all_finished_jobs(&self) -> Result<u64> {
        let now = now_utc();
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET cleared = 1, updated_at = ?1
            WHERE status IN ('completed', 'failed', 'cancelled') AND cleared = 0
            "#,
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }

    /// Rewrite queue positions 0..n-1 in the given order, transactionally.
    pub async fn reorder_queue(&self, ids: &[JobId]) -> Result<()> {
        let now = now_utc();
        let mut tx = self.pool.begin().await?;
        for (position, id) in ids.iter().enumerate() {
            sqlx::query("UPDATE jobs SET queue_position = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(position as i64)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Retry a finished job: synthesize a fresh pending row at the queue tail
    /// referencing the same configuration, and mark the original
    /// `retried + cleared`. The original row is never mutated back into the
    /// queue. Returns the new job id, or None if the job cannot be retried.
    pub async fn retry_job(&self, id: JobId) -> Result<Option<JobId>> {
        let Some(original) = self.get_job(id).await? else {
            return Ok(None);
        };
        if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Ok(None);
        }

        let now = now_utc();
        let command_json = serde_json::to_string(&original.ffmpeg_command)?;
        let config_json = original
            .config_json
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(queue_position) FROM jobs")
            .fetch_one(&mut *tx)
            .await?;
        let new_id = sqlx::query(
            r#"
            INSERT INTO jobs (
                name, input_file, output_file, ffmpeg_command, status, progress,
                queue_position, total_frames, created_at, updated_at,
                config_key, config_json
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?7, ?8, ?9)
            "#,
        )
        .bind(&original.name)
        .bind(&original.input_file)
        .bind(&original.output_file)
        .bind(command_json)
        .bind(max.unwrap_or(-1) + 1)
        .bind(original.total_frames)
        .bind(&now)
        .bind(&original.config_key)
        .bind(config_json)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("UPDATE jobs SET retried = 1, cleared = 1, updated_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(new_id))
    }

    /// Retry every failed, not-yet-retried job. Returns the new job ids.
    pub async fn retry_all_failed(&self) -> Result<Vec<JobId>> {
        let failed = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'failed' AND retried = 0 AND cleared = 0 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut new_ids = Vec::with_capacity(failed.len());
        for row in failed {
            let id: i64 = row.get("id");
            if let Some(new_id) = self.retry_job(id).await? {
                new_ids.push(new_id);
            }
        }
        Ok(new_ids)
    }
}
