//! Local executor: spawns the encoder subprocess, streams its progress
//! output, and atomically finalizes the output file.
//!
//! The encoder writes to a `.fsvtemp.`-prefixed sibling; a clean exit renames
//! it into place, any other outcome unlinks it. Kill sends SIGTERM and
//! escalates to SIGKILL after a grace period.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::store::types::{Job, JobId};

use super::{temp_sibling, ExecutionOutcome, JobExecutor, OutcomeStatus, ProgressEvent, ProgressSender};

/// How long a terminated encoder gets to exit before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Number of stderr lines retained for diagnostics.
const STDERR_RING_LINES: usize = 64;

struct RunningJob {
    job_id: JobId,
    cancel_tx: watch::Sender<bool>,
}

/// Executor that runs the encoder on this node, one job at a time.
pub struct LocalExecutor {
    encoder_bin: String,
    threads: Option<u32>,
    current: Mutex<Option<RunningJob>>,
}

impl LocalExecutor {
    pub fn new(encoder_bin: impl Into<String>, threads: Option<u32>) -> Self {
        Self {
            encoder_bin: encoder_bin.into(),
            threads,
            current: Mutex::new(None),
        }
    }

    fn build_command(&self, job: &Job, temp_path: &Path) -> Command {
        let command = &job.ffmpeg_command;
        let mut cmd = Command::new(&self.encoder_bin);
        cmd.arg("-y").arg("-nostdin");
        if let Some(threads) = self.threads {
            cmd.arg("-threads").arg(threads.to_string());
        }
        cmd.arg("-i").arg(&command.input_path);
        cmd.args(&command.args);
        cmd.arg("-progress").arg("pipe:1");
        cmd.arg(temp_path);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl JobExecutor for LocalExecutor {
    async fn execute(&self, job: &Job, progress: ProgressSender) -> ExecutionOutcome {
        let final_path = PathBuf::from(&job.ffmpeg_command.output_path);
        let temp_path = temp_sibling(&final_path);

        if let Some(parent) = final_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ExecutionOutcome::failed(
                    format!("failed to create output dir {}: {e}", parent.display()),
                    None,
                );
            }
        }

        let mut child = match self.build_command(job, &temp_path).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::failed(
                    format!("failed to spawn encoder {}: {e}", self.encoder_bin),
                    None,
                );
            }
        };

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        *self.current.lock().unwrap() = Some(RunningJob { job_id: job.id, cancel_tx });
        let cancelled = Arc::new(AtomicBool::new(false));

        // Progress stream on stdout: key=value blocks terminated by a
        // `progress=` line. Events observed after a kill are discarded.
        let stdout = child.stdout.take();
        let stdout_task = {
            let cancelled = Arc::clone(&cancelled);
            let total_frames = job.total_frames;
            let duration = job.ffmpeg_command.duration_seconds;
            tokio::spawn(async move {
                let mut parser = ProgressParser::new(total_frames, duration);
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if let Some(event) = parser.feed(&line) {
                            if !cancelled.load(Ordering::SeqCst) {
                                let _ = progress.send(event);
                            }
                        }
                    }
                }
                (parser.last_frame(), parser.last_progress())
            })
        };

        // Bounded stderr ring for diagnostics on failure.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut ring: VecDeque<String> = VecDeque::with_capacity(STDERR_RING_LINES);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if ring.len() == STDERR_RING_LINES {
                        ring.pop_front();
                    }
                    ring.push_back(line);
                }
            }
            ring.into_iter().collect::<Vec<_>>().join("\n")
        });

        let pid = child.id();
        let mut term_sent = false;
        let mut kill_deadline: Option<Instant> = None;
        let wait_result = loop {
            let escalate = {
                let deadline = kill_deadline;
                async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                }
            };
            tokio::select! {
                status = child.wait() => break status,
                changed = cancel_rx.changed(), if !term_sent => {
                    // The only value ever sent is the kill request.
                    if changed.is_ok() {
                        term_sent = true;
                        cancelled.store(true, Ordering::SeqCst);
                        signal_pid(pid, Signal::Term);
                        kill_deadline = Some(Instant::now() + KILL_GRACE);
                    }
                }
                _ = escalate => {
                    kill_deadline = None;
                    signal_pid(pid, Signal::Kill);
                }
            }
        };

        {
            let mut current = self.current.lock().unwrap();
            if current.as_ref().is_some_and(|r| r.job_id == job.id) {
                *current = None;
            }
        }

        if cancelled.load(Ordering::SeqCst) {
            // A lingering grandchild may hold the pipes open; don't wait for EOF.
            stdout_task.abort();
            stderr_task.abort();
            remove_quiet(&temp_path).await;
            return ExecutionOutcome::cancelled();
        }

        let (last_frame, last_progress) = stdout_task.await.unwrap_or((None, 0.0));
        let stderr_tail = stderr_task.await.unwrap_or_default();

        match wait_result {
            Ok(status) if status.success() => {
                if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
                    remove_quiet(&temp_path).await;
                    return ExecutionOutcome::failed(
                        format!("failed to finalize output {}: {e}", final_path.display()),
                        None,
                    );
                }
                tracing::info!(job_id = job.id, "encode finished: {}", final_path.display());
                ExecutionOutcome::success(
                    final_path.to_string_lossy().into_owned(),
                    job.total_frames.or(last_frame),
                    last_progress,
                )
            }
            Ok(status) => {
                remove_quiet(&temp_path).await;
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                ExecutionOutcome::failed(
                    format!("encoder exited with status {code}"),
                    non_empty(stderr_tail),
                )
            }
            Err(e) => {
                remove_quiet(&temp_path).await;
                ExecutionOutcome::failed(format!("encoder wait failed: {e}"), non_empty(stderr_tail))
            }
        }
    }

    async fn kill(&self, job_id: JobId) {
        let current = self.current.lock().unwrap();
        match current.as_ref() {
            Some(running) if running.job_id == job_id => {
                let _ = running.cancel_tx.send(true);
            }
            _ => tracing::debug!(job_id, "kill requested for job not running here"),
        }
    }
}

enum Signal {
    Term,
    Kill,
}

/// SIGTERM first; the wait loop escalates to SIGKILL after the grace period.
#[cfg(unix)]
fn signal_pid(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as i32, sig);
    }
}

/// Stub for non-Unix: no signal ladder; `kill_on_drop` remains the backstop.
#[cfg(not(unix))]
fn signal_pid(_pid: Option<u32>, _signal: Signal) {}

async fn remove_quiet(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "temp file cleanup: {}", e);
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Incremental parser for the encoder's `-progress` stream: `key=value` lines
/// terminated by `progress=continue|end`.
struct ProgressParser {
    total_frames: Option<i64>,
    duration_seconds: Option<f64>,
    frame: Option<i64>,
    fps: Option<f64>,
    speed: Option<f64>,
    out_time: Option<f64>,
    last_progress: f64,
}

impl ProgressParser {
    fn new(total_frames: Option<i64>, duration_seconds: Option<f64>) -> Self {
        Self {
            total_frames,
            duration_seconds,
            frame: None,
            fps: None,
            speed: None,
            out_time: None,
            last_progress: 0.0,
        }
    }

    fn last_frame(&self) -> Option<i64> {
        self.frame
    }

    fn last_progress(&self) -> f64 {
        self.last_progress
    }

    fn feed(&mut self, line: &str) -> Option<ProgressEvent> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            "frame" => {
                self.frame = value.trim().parse().ok();
                None
            }
            "fps" => {
                self.fps = value.trim().parse().ok();
                None
            }
            "speed" => {
                self.speed = value.trim().trim_end_matches('x').parse().ok();
                None
            }
            "out_time" => {
                self.out_time = parse_clock_time(value.trim());
                None
            }
            // `out_time_ms` is actually microseconds (FFmpeg ticket #7345).
            "out_time_ms" | "out_time_us" => {
                self.out_time = value.trim().parse::<f64>().ok().map(|us| us / 1_000_000.0);
                None
            }
            "progress" => {
                let ended = value.trim().eq_ignore_ascii_case("end");
                let pct = if ended { 100.0 } else { self.estimate() };
                self.last_progress = pct;
                Some(ProgressEvent {
                    frame: self.frame,
                    fps: self.fps,
                    speed: self.speed,
                    progress: pct,
                })
            }
            _ => None,
        }
    }

    fn estimate(&self) -> f64 {
        if let (Some(total), Some(frame)) = (self.total_frames, self.frame) {
            if total > 0 {
                return (frame as f64 / total as f64 * 100.0).min(100.0);
            }
        }
        if let (Some(duration), Some(elapsed)) = (self.duration_seconds, self.out_time) {
            if duration > 0.0 {
                return (elapsed / duration * 100.0).min(100.0);
            }
        }
        self.last_progress
    }
}

/// Parse an `HH:MM:SS.frac` clock value to seconds.
fn parse_clock_time(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() == 3 {
        let h: f64 = parts[0].parse().ok()?;
        let m: f64 = parts[1].parse().ok()?;
        let sec: f64 = parts[2].parse().ok()?;
        return Some(h * 3600.0 + m * 60.0 + sec);
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{EncoderCommand, Job, JobStatus};
    use tokio::sync::mpsc;

    #[test]
    fn parser_frame_based_progress() {
        let mut p = ProgressParser::new(Some(200), None);
        assert!(p.feed("frame=50").is_none());
        assert!(p.feed("fps=25.0").is_none());
        assert!(p.feed("speed=1.5x").is_none());
        let ev = p.feed("progress=continue").unwrap();
        assert_eq!(ev.frame, Some(50));
        assert_eq!(ev.fps, Some(25.0));
        assert_eq!(ev.speed, Some(1.5));
        assert_eq!(ev.progress, 25.0);

        p.feed("frame=400");
        let ev = p.feed("progress=continue").unwrap();
        assert_eq!(ev.progress, 100.0, "capped at 100");
    }

    #[test]
    fn parser_time_based_fallback() {
        let mut p = ProgressParser::new(None, Some(20.0));
        p.feed("frame=10");
        p.feed("out_time=00:00:05.000000");
        let ev = p.feed("progress=continue").unwrap();
        assert_eq!(ev.progress, 25.0);

        // Microsecond variant (FFmpeg reports out_time_ms in µs).
        p.feed("out_time_ms=10000000");
        let ev = p.feed("progress=continue").unwrap();
        assert_eq!(ev.progress, 50.0);
    }

    #[test]
    fn parser_end_marker_is_always_full() {
        let mut p = ProgressParser::new(None, None);
        p.feed("frame=10");
        let ev = p.feed("progress=continue").unwrap();
        assert_eq!(ev.progress, 0.0, "no estimate without totals");
        let ev = p.feed("progress=END").unwrap();
        assert_eq!(ev.progress, 100.0);
    }

    #[test]
    fn parser_ignores_noise() {
        let mut p = ProgressParser::new(Some(100), None);
        assert!(p.feed("bitrate=1200.0kbits/s").is_none());
        assert!(p.feed("").is_none());
        assert!(p.feed("not a kv line").is_none());
    }

    #[cfg(unix)]
    mod process_tests {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn job(id: i64, input: &Path, output: &Path, total: Option<i64>) -> Job {
            Job {
                id,
                name: "test".into(),
                input_file: input.to_string_lossy().into_owned(),
                output_file: Some(output.to_string_lossy().into_owned()),
                ffmpeg_command: EncoderCommand {
                    args: vec![],
                    input_path: input.to_string_lossy().into_owned(),
                    output_path: output.to_string_lossy().into_owned(),
                    duration_seconds: None,
                },
                status: JobStatus::Processing,
                progress: 0.0,
                queue_position: Some(0),
                total_frames: total,
                error_message: None,
                created_at: "2024-01-01T00:00:00Z".into(),
                updated_at: "2024-01-01T00:00:00Z".into(),
                started_at: None,
                ended_at: None,
                config_key: None,
                config_json: None,
                retried: false,
                cleared: false,
                assigned_worker: None,
                worker_last_seen: None,
            }
        }

        fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[tokio::test]
        async fn successful_encode_finalizes_output() {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("in.mp4");
            std::fs::write(&input, b"src").unwrap();
            let output = dir.path().join("out.mp4");
            // Mock encoder: emit two progress blocks, write the last arg (temp path).
            let script = write_script(
                dir.path(),
                "encoder.sh",
                r#"for last; do :; done
printf 'frame=100\nfps=30.0\nspeed=2.0x\nprogress=continue\n'
printf 'frame=200\nfps=30.0\nspeed=2.0x\nprogress=end\n'
echo encoded > "$last"
"#,
            );

            let exec = LocalExecutor::new(script.to_string_lossy(), None);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let outcome = exec
                .execute(&job(1, &input, &output, Some(200)), tx)
                .await;

            assert_eq!(outcome.status, OutcomeStatus::Success);
            assert_eq!(outcome.output_file.as_deref(), output.to_str());
            assert_eq!(outcome.total_frames, Some(200));
            assert!(output.exists(), "temp renamed into place");
            assert!(!temp_sibling(&output).exists());

            let first = rx.recv().await.unwrap();
            assert_eq!(first.progress, 50.0);
            let second = rx.recv().await.unwrap();
            assert_eq!(second.progress, 100.0);
        }

        #[tokio::test]
        async fn failed_encode_cleans_temp_and_keeps_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("in.mp4");
            std::fs::write(&input, b"src").unwrap();
            let output = dir.path().join("out.mp4");
            let script = write_script(
                dir.path(),
                "encoder.sh",
                r#"for last; do :; done
echo partial > "$last"
echo 'Unsupported codec' >&2
exit 2
"#,
            );

            let exec = LocalExecutor::new(script.to_string_lossy(), None);
            let (tx, _rx) = mpsc::unbounded_channel();
            let outcome = exec.execute(&job(2, &input, &output, None), tx).await;

            assert_eq!(outcome.status, OutcomeStatus::Failed);
            assert_eq!(
                outcome.error.as_deref(),
                Some("encoder exited with status 2")
            );
            assert!(outcome.stderr_tail.unwrap().contains("Unsupported codec"));
            assert!(!output.exists());
            assert!(!temp_sibling(&output).exists(), "temp unlinked on failure");
        }

        #[tokio::test]
        async fn kill_terminates_promptly_and_removes_temp() {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("in.mp4");
            std::fs::write(&input, b"src").unwrap();
            let output = dir.path().join("out.mp4");
            let script = write_script(
                dir.path(),
                "encoder.sh",
                r#"for last; do :; done
echo hang > "$last"
printf 'frame=1\nprogress=continue\n'
sleep 30
"#,
            );

            let exec = std::sync::Arc::new(LocalExecutor::new(script.to_string_lossy(), None));
            let (tx, mut rx) = mpsc::unbounded_channel();
            let job = job(3, &input, &output, Some(100));

            let runner = {
                let exec = std::sync::Arc::clone(&exec);
                tokio::spawn(async move { exec.execute(&job, tx).await })
            };
            // Wait for the first progress event so the child is alive.
            let _ = rx.recv().await;
            exec.kill(3).await;

            let outcome = tokio::time::timeout(Duration::from_secs(10), runner)
                .await
                .expect("killed execute returns promptly")
                .unwrap();
            assert_eq!(outcome.status, OutcomeStatus::Cancelled);
            assert_eq!(outcome.error.as_deref(), Some("cancelled"));
            assert!(!temp_sibling(&output).exists(), "temp removed after kill");
        }

        #[tokio::test]
        async fn spawn_failure_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("in.mp4");
            let output = dir.path().join("out.mp4");
            let missing = dir.path().join("nonexistent-encoder");

            let exec = LocalExecutor::new(missing.to_string_lossy(), None);
            let (tx, _rx) = mpsc::unbounded_channel();
            let outcome = exec.execute(&job(4, &input, &output, None), tx).await;
            assert_eq!(outcome.status, OutcomeStatus::Failed);
            assert!(outcome.error.unwrap().contains("failed to spawn encoder"));
        }
    }
}
