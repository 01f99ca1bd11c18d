use std::collections::HashSet;
use std::time::Duration;

use super::jobs::write::STALE_WORKER_ERROR;
use super::types::{EncoderCommand, JobPatch, JobStatus, NewJob};
use super::Store;
use crate::cursor::Cursor;

fn command(input: &str, output: &str) -> EncoderCommand {
    EncoderCommand {
        args: vec!["-c:v".into(), "libx264".into()],
        input_path: input.into(),
        output_path: output.into(),
        duration_seconds: None,
    }
}

fn new_job(name: &str, position: Option<i64>) -> NewJob {
    NewJob {
        name: name.into(),
        input_file: format!("/media/{name}.mp4"),
        output_file: Some(format!("/media/out/{name}.mp4")),
        command: command(&format!("/media/{name}.mp4"), &format!("/media/out/{name}.mp4")),
        queue_position: position,
        total_frames: None,
        config_key: None,
        config_json: None,
    }
}

#[tokio::test]
async fn create_and_get_roundtrip() {
    let store = Store::open_in_memory().await.unwrap();
    let id = store.create_job(&new_job("a", Some(0))).await.unwrap();

    let job = store.get_job(id).await.unwrap().expect("job exists");
    assert_eq!(job.id, id);
    assert_eq!(job.name, "a");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.progress, 0.0);
    assert_eq!(job.queue_position, Some(0));
    assert_eq!(job.ffmpeg_command.input_path, "/media/a.mp4");
    assert!(!job.retried);
    assert!(!job.cleared);
    assert!(job.assigned_worker.is_none());
    // Timestamps are normalized at the read boundary.
    assert!(job.created_at.ends_with('Z'));
    assert!(job.created_at.contains('T'));
}

#[tokio::test]
async fn migrations_record_version() {
    let store = Store::open_in_memory().await.unwrap();
    let version = store.meta_get("version").await.unwrap().unwrap();
    assert_eq!(
        version.parse::<usize>().unwrap(),
        super::migrations::MIGRATIONS.len()
    );
}

#[tokio::test]
async fn claim_next_sets_processing_and_worker() {
    let store = Store::open_in_memory().await.unwrap();
    let id = store.create_job(&new_job("a", Some(0))).await.unwrap();

    let job = store.claim_next("w1").await.unwrap().expect("claimed");
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.assigned_worker.as_deref(), Some("w1"));
    assert!(job.started_at.is_some());
    assert!(job.worker_last_seen.is_some());

    // Nothing else to claim.
    assert!(store.claim_next("w2").await.unwrap().is_none());
}

#[tokio::test]
async fn claim_respects_queue_order_with_nulls_last() {
    let store = Store::open_in_memory().await.unwrap();
    let unpositioned = store.create_job(&new_job("tail", None)).await.unwrap();
    let second = store.create_job(&new_job("b", Some(5))).await.unwrap();
    let first = store.create_job(&new_job("a", Some(2))).await.unwrap();

    assert_eq!(store.claim_next("w").await.unwrap().unwrap().id, first);
    assert_eq!(store.claim_next("w").await.unwrap().unwrap().id, second);
    assert_eq!(store.claim_next("w").await.unwrap().unwrap().id, unpositioned);
}

#[tokio::test]
async fn concurrent_claimers_receive_disjoint_jobs() {
    let store = Store::open_in_memory().await.unwrap();
    for i in 0..5 {
        store.create_job(&new_job(&format!("j{i}"), Some(i))).await.unwrap();
    }

    let claim_all = |store: Store, worker: &'static str| async move {
        let mut ids = Vec::new();
        while let Some(job) = store.claim_next(worker).await.unwrap() {
            ids.push(job.id);
        }
        ids
    };

    let (a, b) = tokio::join!(
        tokio::spawn(claim_all(store.clone(), "w1")),
        tokio::spawn(claim_all(store.clone(), "w2")),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    let union: HashSet<i64> = a.iter().chain(b.iter()).copied().collect();
    assert_eq!(union.len(), a.len() + b.len(), "no job claimed twice");
    assert_eq!(union.len(), 5, "every job claimed exactly once");
}

#[tokio::test]
async fn heartbeat_is_noop_for_other_worker() {
    let store = Store::open_in_memory().await.unwrap();
    let id = store.create_job(&new_job("a", Some(0))).await.unwrap();
    let job = store.claim_next("w1").await.unwrap().unwrap();

    // Pin the heartbeat into the past, then beat as the wrong worker.
    store
        .update_job(
            id,
            &JobPatch {
                worker_last_seen: Some(Some("2000-01-01 00:00:00".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store.update_worker_heartbeat(id, "w2").await.unwrap();
    let unchanged = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(unchanged.worker_last_seen.as_deref(), Some("2000-01-01T00:00:00Z"));

    // The owning worker's beat lands.
    store.update_worker_heartbeat(id, "w1").await.unwrap();
    let beaten = store.get_job(id).await.unwrap().unwrap();
    assert_ne!(beaten.worker_last_seen, unchanged.worker_last_seen);
    assert_eq!(job.id, id);
}

#[tokio::test]
async fn release_stale_jobs_fails_unresponsive_workers() {
    let store = Store::open_in_memory().await.unwrap();
    let id = store.create_job(&new_job("a", Some(0))).await.unwrap();
    store.claim_next("w1").await.unwrap().unwrap();
    store
        .update_job(
            id,
            &JobPatch {
                worker_last_seen: Some(Some("2000-01-01 00:00:00".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let released = store.release_stale_jobs(Duration::from_secs(300)).await.unwrap();
    assert_eq!(released, 1);

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(STALE_WORKER_ERROR));
    assert!(job.assigned_worker.is_none());

    // Fresh heartbeats are untouched.
    let id2 = store.create_job(&new_job("b", Some(1))).await.unwrap();
    store.claim_next("w2").await.unwrap().unwrap();
    assert_eq!(store.release_stale_jobs(Duration::from_secs(300)).await.unwrap(), 0);
    assert_eq!(
        store.get_job(id2).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
}

#[tokio::test]
async fn reset_processing_jobs_reverts_to_pending() {
    let store = Store::open_in_memory().await.unwrap();
    let id = store.create_job(&new_job("a", Some(0))).await.unwrap();
    store.claim_next("w1").await.unwrap().unwrap();
    store.update_progress(id, 40.0).await.unwrap();

    let reset = store.reset_processing_jobs().await.unwrap();
    assert_eq!(reset, 1);

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.progress, 0.0);
    assert!(job.assigned_worker.is_none());
    assert!(job.started_at.is_none());
}

#[tokio::test]
async fn complete_and_fail_terminal_invariants() {
    let store = Store::open_in_memory().await.unwrap();
    let done = store.create_job(&new_job("done", Some(0))).await.unwrap();
    let broken = store.create_job(&new_job("broken", Some(1))).await.unwrap();
    store.claim_next("w").await.unwrap();
    store.claim_next("w").await.unwrap();

    store.complete_job(done, "/media/out/done.mp4", Some(2400)).await.unwrap();
    store.fail_job(broken, "encoder exited with status 1").await.unwrap();

    let done = store.get_job(done).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100.0);
    assert_eq!(done.output_file.as_deref(), Some("/media/out/done.mp4"));
    assert_eq!(done.total_frames, Some(2400));
    assert!(done.ended_at.is_some());

    let broken = store.get_job(broken).await.unwrap().unwrap();
    assert_eq!(broken.status, JobStatus::Failed);
    assert!(broken.error_message.is_some());
}

#[tokio::test]
async fn status_counts_exclude_cleared() {
    let store = Store::open_in_memory().await.unwrap();
    store.create_job(&new_job("p1", Some(0))).await.unwrap();
    store.create_job(&new_job("p2", Some(1))).await.unwrap();
    let done = store.create_job(&new_job("d", Some(2))).await.unwrap();
    store.claim_next("w").await.unwrap();
    store.claim_next("w").await.unwrap();
    store.claim_next("w").await.unwrap();
    store.complete_job(done, "/media/out/d.mp4", None).await.unwrap();

    let counts = store.get_status_counts().await.unwrap();
    assert_eq!(counts.processing, 2);
    assert_eq!(counts.completed, 1);

    assert_eq!(store.clear_successful_jobs().await.unwrap(), 1);
    let counts = store.get_status_counts().await.unwrap();
    assert_eq!(counts.completed, 0);
}

#[tokio::test]
async fn clear_all_finished_hides_every_terminal_row() {
    let store = Store::open_in_memory().await.unwrap();
    let a = store.create_job(&new_job("a", Some(0))).await.unwrap();
    let b = store.create_job(&new_job("b", Some(1))).await.unwrap();
    let c = store.create_job(&new_job("c", Some(2))).await.unwrap();
    store.claim_next("w").await.unwrap();
    store.complete_job(a, "/media/out/a.mp4", None).await.unwrap();
    store.claim_next("w").await.unwrap();
    store.fail_job(b, "boom").await.unwrap();
    store.cancel_job(c, "cancelled by user").await.unwrap();

    assert_eq!(store.get_clearable_jobs_count().await.unwrap(), 3);
    assert_eq!(store.clear_all_finished_jobs().await.unwrap(), 3);
    assert_eq!(store.get_clearable_jobs_count().await.unwrap(), 0);

    // Cleared rows disappear from the default listing but stay fetchable.
    let page = store.get_paginated(10, None, false).await.unwrap();
    assert!(page.jobs.is_empty());
    let page = store.get_paginated(10, None, true).await.unwrap();
    assert_eq!(page.jobs.len(), 3);
}

#[tokio::test]
async fn submission_positions_are_contiguous() {
    let store = Store::open_in_memory().await.unwrap();
    // Simulate two submissions appending to the tail.
    for batch in 0..2 {
        let base = store.get_max_queue_position().await.unwrap().map_or(0, |m| m + 1);
        for i in 0..3 {
            store
                .create_job(&new_job(&format!("b{batch}f{i}"), Some(base + i)))
                .await
                .unwrap();
        }
    }
    assert_eq!(store.get_max_queue_position().await.unwrap(), Some(5));

    let queue = store.get_queue().await.unwrap();
    let positions: Vec<i64> = queue.iter().filter_map(|j| j.queue_position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn reorder_queue_writes_dense_positions() {
    let store = Store::open_in_memory().await.unwrap();
    let a = store.create_job(&new_job("a", Some(0))).await.unwrap();
    let b = store.create_job(&new_job("b", Some(1))).await.unwrap();
    let c = store.create_job(&new_job("c", Some(2))).await.unwrap();

    store.reorder_queue(&[c, a, b]).await.unwrap();
    let queue = store.get_queue().await.unwrap();
    let ids: Vec<i64> = queue.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![c, a, b]);
    let positions: Vec<i64> = queue.iter().filter_map(|j| j.queue_position).collect();
    assert_eq!(positions, vec![0, 1, 2]);
}

#[tokio::test]
async fn retry_synthesizes_new_job_and_marks_original() {
    let store = Store::open_in_memory().await.unwrap();
    let id = store.create_job(&new_job("a", Some(0))).await.unwrap();
    store.claim_next("w").await.unwrap();
    store.fail_job(id, "boom").await.unwrap();

    let new_id = store.retry_job(id).await.unwrap().expect("retryable");
    assert_ne!(new_id, id);

    let original = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(original.status, JobStatus::Failed);
    assert!(original.retried);
    assert!(original.cleared);

    let fresh = store.get_job(new_id).await.unwrap().unwrap();
    assert_eq!(fresh.status, JobStatus::Pending);
    assert_eq!(fresh.name, "a");
    assert_eq!(fresh.input_file, original.input_file);
    assert_eq!(fresh.queue_position, Some(1));
    assert!(fresh.error_message.is_none());

    // A pending job is not retryable.
    assert!(store.retry_job(new_id).await.unwrap().is_none());
}

#[tokio::test]
async fn retry_all_failed_skips_already_retried() {
    let store = Store::open_in_memory().await.unwrap();
    let a = store.create_job(&new_job("a", Some(0))).await.unwrap();
    let b = store.create_job(&new_job("b", Some(1))).await.unwrap();
    store.claim_next("w").await.unwrap();
    store.fail_job(a, "x").await.unwrap();
    store.claim_next("w").await.unwrap();
    store.fail_job(b, "y").await.unwrap();
    store.retry_job(a).await.unwrap();

    assert_eq!(store.get_failed_not_retried_count().await.unwrap(), 1);
    let new_ids = store.retry_all_failed().await.unwrap();
    assert_eq!(new_ids.len(), 1);
    assert_eq!(store.get_failed_not_retried_count().await.unwrap(), 0);
}

#[tokio::test]
async fn cancel_pending_jobs_leaves_processing_alone() {
    let store = Store::open_in_memory().await.unwrap();
    let running = store.create_job(&new_job("run", Some(0))).await.unwrap();
    store.create_job(&new_job("q1", Some(1))).await.unwrap();
    store.create_job(&new_job("q2", Some(2))).await.unwrap();
    store.claim_next("w").await.unwrap();

    let cancelled = store.cancel_pending_jobs().await.unwrap();
    assert_eq!(cancelled.len(), 2);
    assert_eq!(
        store.get_job(running).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
    assert_eq!(store.get_jobs_by_status(JobStatus::Cancelled).await.unwrap().len(), 2);
}

#[tokio::test]
async fn pagination_fills_page_across_sections() {
    let store = Store::open_in_memory().await.unwrap();
    // 3 pending, 4 finished.
    for i in 0..3 {
        store.create_job(&new_job(&format!("p{i}"), Some(10 + i))).await.unwrap();
    }
    let mut finished = Vec::new();
    for i in 0..4 {
        let id = store.create_job(&new_job(&format!("f{i}"), Some(i))).await.unwrap();
        finished.push(id);
    }
    for &id in &finished {
        store.claim_next("w").await.unwrap();
        store.complete_job(id, "/media/out/x.mp4", None).await.unwrap();
    }

    let first = store.get_paginated(4, None, false).await.unwrap();
    assert_eq!(first.jobs.len(), 4);
    assert!(first.has_more);
    let statuses: Vec<JobStatus> = first.jobs.iter().map(|j| j.status).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Pending,
            JobStatus::Pending,
            JobStatus::Pending,
            JobStatus::Completed
        ]
    );
    let cursor = first.next_cursor.clone().expect("cursor present");
    assert!(matches!(cursor, Cursor::Finished { .. }));

    let second = store.get_paginated(4, Some(cursor), false).await.unwrap();
    assert_eq!(second.jobs.len(), 3);
    assert!(!second.has_more);
    assert!(second.next_cursor.is_none());
}

#[tokio::test]
async fn pagination_walk_visits_every_row_once() {
    let store = Store::open_in_memory().await.unwrap();
    let mut expected = HashSet::new();
    for i in 0..5 {
        expected.insert(store.create_job(&new_job(&format!("p{i}"), Some(100 + i))).await.unwrap());
    }
    for i in 0..7 {
        let id = store.create_job(&new_job(&format!("f{i}"), Some(i))).await.unwrap();
        store.claim_next("w").await.unwrap();
        if i % 2 == 0 {
            store.complete_job(id, "/media/out/x.mp4", None).await.unwrap();
        } else {
            store.fail_job(id, "boom").await.unwrap();
        }
        expected.insert(id);
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    let mut crossed_into_finished = false;
    loop {
        let page = store.get_paginated(3, cursor.take(), false).await.unwrap();
        for job in &page.jobs {
            // Section order: once finished rows start, no queue rows may follow.
            if job.status.is_finished() {
                crossed_into_finished = true;
            } else {
                assert!(!crossed_into_finished, "queue row after finished section");
            }
            seen.push(job.id);
        }
        if !page.has_more {
            break;
        }
        cursor = page.next_cursor;
        assert!(cursor.is_some(), "has_more implies a cursor");
    }

    let unique: HashSet<i64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "no row visited twice");
    assert_eq!(unique, expected, "every row visited");
}

#[tokio::test]
async fn pagination_resumes_mid_queue_section() {
    let store = Store::open_in_memory().await.unwrap();
    for i in 0..6 {
        store.create_job(&new_job(&format!("p{i}"), Some(i))).await.unwrap();
    }

    let first = store.get_paginated(2, None, false).await.unwrap();
    assert_eq!(first.jobs.len(), 2);
    assert!(matches!(first.next_cursor, Some(Cursor::Pending { .. })));

    let second = store
        .get_paginated(2, first.next_cursor.clone(), false)
        .await
        .unwrap();
    let first_ids: Vec<i64> = first.jobs.iter().map(|j| j.id).collect();
    let second_ids: Vec<i64> = second.jobs.iter().map(|j| j.id).collect();
    assert!(first_ids.iter().all(|id| !second_ids.contains(id)));
    assert_eq!(second_ids.len(), 2);
}

#[tokio::test]
async fn legacy_cursor_lists_from_the_start() {
    let store = Store::open_in_memory().await.unwrap();
    let first = store.create_job(&new_job("a", Some(0))).await.unwrap();
    store.create_job(&new_job("b", Some(1))).await.unwrap();

    let page = store
        .get_paginated(10, Some(Cursor::initial()), false)
        .await
        .unwrap();
    assert_eq!(page.jobs.first().map(|j| j.id), Some(first));
    assert_eq!(page.jobs.len(), 2);
}

#[tokio::test]
async fn config_blobs_are_content_addressed_and_gced() {
    let store = Store::open_in_memory().await.unwrap();
    let files = vec!["/media/a.mp4".to_string(), "/media/b.mp4".to_string()];
    let config = serde_json::json!({"codec": "libx265", "crf": 23});

    let key = store.put_config_blob(&files, &config, None).await.unwrap();
    let again = store.put_config_blob(&files, &config, None).await.unwrap();
    assert_eq!(key, again, "identical payloads share one key");

    let blob = store.get_config_blob(&key).await.unwrap().expect("stored");
    assert_eq!(blob.file_paths, files);
    assert_eq!(blob.config_json, config);

    // Young blobs survive GC.
    assert_eq!(store.gc_config_blobs(Duration::from_secs(3600)).await.unwrap(), 0);
    // Unreferenced blobs past retention are collected.
    assert_eq!(store.gc_config_blobs(Duration::from_secs(0)).await.unwrap(), 1);
    assert!(store.get_config_blob(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn referenced_config_blobs_survive_gc() {
    let store = Store::open_in_memory().await.unwrap();
    let files = vec!["/media/a.mp4".to_string()];
    let config = serde_json::json!({"codec": "libx264"});
    let key = store.put_config_blob(&files, &config, None).await.unwrap();

    let mut job = new_job("a", Some(0));
    job.config_key = Some(key.clone());
    store.create_job(&job).await.unwrap();

    assert_eq!(store.gc_config_blobs(Duration::from_secs(0)).await.unwrap(), 0);
    assert!(store.get_config_blob(&key).await.unwrap().is_some());
}

#[tokio::test]
async fn batches_track_submission_progress() {
    let store = Store::open_in_memory().await.unwrap();
    let batch = store.create_batch(3, None).await.unwrap();
    for _ in 0..3 {
        store.bump_batch_created(batch).await.unwrap();
    }
    store.finish_batch(batch, None).await.unwrap();

    let row = store.get_batch(batch).await.unwrap().expect("batch exists");
    assert_eq!(row.total_files, 3);
    assert_eq!(row.created_count, 3);
    assert_eq!(row.status, "completed");

    let failed = store.create_batch(2, None).await.unwrap();
    store.finish_batch(failed, Some("path outside media root")).await.unwrap();
    let row = store.get_batch(failed).await.unwrap().unwrap();
    assert_eq!(row.status, "failed");
    assert_eq!(row.error_message.as_deref(), Some("path outside media root"));
}
