//! Job read operations: lookups, queue views, counts, cursor pagination.

use anyhow::Result;
use sqlx::Row;

use crate::cursor::Cursor;

use super::super::db::{job_from_row, Store, JOB_COLUMNS};
use super::super::types::{denormalize_timestamp, Job, JobId, JobPage, JobStatus, StatusCounts};

/// Largest page a single listing call will return.
const MAX_PAGE_LIMIT: i64 = 200;

impl Store {
    /// Fetch a single job row.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// All jobs with the given status, oldest first.
    pub async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// The active queue: pending and processing rows in queue order.
    pub async fn get_queue(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status IN ('pending', 'processing')
             ORDER BY queue_position ASC NULLS LAST, created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Highest queue position currently assigned, for append-to-tail submission.
    pub async fn get_max_queue_position(&self) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(queue_position) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    /// Per-status totals, cleared rows excluded.
    pub async fn get_status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM jobs WHERE cleared = 0 GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match JobStatus::parse(&status) {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Processing => counts.processing = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
                JobStatus::Cancelled => counts.cancelled = n,
            }
        }
        Ok(counts)
    }

    /// Failed jobs that have not been retried yet (retry-all-failed candidates).
    pub async fn get_failed_not_retried_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status = 'failed' AND retried = 0 AND cleared = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Finished rows that would be hidden by a clear action.
    pub async fn get_clearable_jobs_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs
             WHERE status IN ('completed', 'failed', 'cancelled') AND cleared = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Cursor-paginated default listing: the queue section first
    /// (`queue_position asc nulls last, created_at asc, id asc`), then finished
    /// rows (`updated_at desc, id desc`). A page that exhausts the queue section
    /// is filled from the head of the finished section; the next-cursor anchors
    /// on the last emitted row.
    pub async fn get_paginated(
        &self,
        limit: i64,
        cursor: Option<Cursor>,
        include_cleared: bool,
    ) -> Result<JobPage> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT) as usize;
        let mut jobs: Vec<Job> = Vec::new();
        let mut has_more = false;

        let finished_after = match &cursor {
            Some(Cursor::Finished { updated_at, id }) => Some((updated_at.clone(), *id)),
            _ => None,
        };

        if finished_after.is_none() {
            let pending_after = match &cursor {
                Some(Cursor::Pending { queue_position, created_at, id })
                    if !(created_at.is_empty() && *id == 0) =>
                {
                    Some((*queue_position, created_at.clone(), *id))
                }
                _ => None,
            };
            let mut pending = self.fetch_pending_page(pending_after, limit + 1).await?;
            if pending.len() > limit {
                pending.truncate(limit);
                has_more = true;
            }
            jobs = pending;
        }

        if !has_more {
            let remaining = limit - jobs.len();
            let mut finished = self
                .fetch_finished_page(finished_after, include_cleared, remaining + 1)
                .await?;
            if finished.len() > remaining {
                finished.truncate(remaining);
                has_more = true;
            }
            jobs.extend(finished);
        }

        let next_cursor = if has_more {
            jobs.last().map(|job| {
                if job.status.is_finished() {
                    Cursor::Finished {
                        updated_at: job.updated_at.clone(),
                        id: job.id,
                    }
                } else {
                    Cursor::Pending {
                        queue_position: job.queue_position,
                        created_at: job.created_at.clone(),
                        id: job.id,
                    }
                }
            })
        } else {
            None
        };

        Ok(JobPage { jobs, has_more, next_cursor })
    }

    async fn fetch_pending_page(
        &self,
        after: Option<(Option<i64>, String, i64)>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let order = "ORDER BY queue_position ASC NULLS LAST, created_at ASC, id ASC LIMIT ?";
        let rows = match after {
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status IN ('pending', 'processing') {order}"
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            // Continuation from a positioned row: strictly greater in
            // (queue_position, created_at, id); NULL positions sort last.
            Some((Some(qp), created_at, id)) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status IN ('pending', 'processing')
                       AND (queue_position > ?1
                            OR queue_position IS NULL
                            OR (queue_position = ?1
                                AND (created_at > ?2 OR (created_at = ?2 AND id > ?3))))
                     {order}"
                ))
                .bind(qp)
                .bind(denormalize_timestamp(&created_at))
                .bind(id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            // Continuation from an unpositioned row: only other NULL-position
            // rows can follow.
            Some((None, created_at, id)) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status IN ('pending', 'processing')
                       AND queue_position IS NULL
                       AND (created_at > ?1 OR (created_at = ?1 AND id > ?2))
                     {order}"
                ))
                .bind(denormalize_timestamp(&created_at))
                .bind(id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    async fn fetch_finished_page(
        &self,
        after: Option<(String, i64)>,
        include_cleared: bool,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let order = "ORDER BY updated_at DESC, id DESC LIMIT ?";
        let rows = match after {
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status IN ('completed', 'failed', 'cancelled')
                       AND (?1 OR cleared = 0) {order}"
                ))
                .bind(include_cleared)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            Some((updated_at, id)) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status IN ('completed', 'failed', 'cancelled')
                       AND (?1 OR cleared = 0)
                       AND (updated_at < ?2 OR (updated_at = ?2 AND id < ?3))
                     {order}"
                ))
                .bind(include_cleared)
                .bind(denormalize_timestamp(&updated_at))
                .bind(id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }
}
