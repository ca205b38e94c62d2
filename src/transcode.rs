//! The single-job transcode state machine: spawn the external encoder, stream progress from
//! two concurrent readers, and either replace the source in place or record an error.
//!
//! Tracks one cancel handle per in-flight job id so the API can kill a `processing` job on
//! delete.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::Result;
use crate::profiles;
use crate::store::{QueueJob, Store};

const STDERR_TAIL_LINES: usize = 40;

fn ffmpeg_bin() -> String {
    std::env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string())
}

/// Registry of in-flight jobs, keyed by job id, used to kill a job's transcoder on cancel.
#[derive(Clone)]
pub struct CancelHandles {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl CancelHandles {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Requests the job's transcoder be killed. Returns `true` if a matching job was found.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut guard = self.inner.lock().unwrap();
        match guard.remove(job_id) {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

impl Default for CancelHandles {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one queued job to completion: claims it, transcodes, and finalises (replace or
/// record error). Never propagates a transcode failure as an `Err` — all outcomes are
/// recorded in history and the return value only signals unexpected store/IO errors.
pub async fn run_job(
    store: &Store,
    cancel_handles: &CancelHandles,
    cache_dir: Option<&PathBuf>,
    gpu_mode: &str,
    job: &QueueJob,
) -> Result<()> {
    let source = PathBuf::from(&job.file_path);
    if !source.exists() {
        store
            .add_history(
                job.library_id.as_deref(),
                &job.file_path,
                job.file_size,
                0,
                0.0,
                "error",
                Some("Bestand niet gevonden"),
            )
            .await?;
        store.delete_job(&job.id).await?;
        return Ok(());
    }

    let temp_out = temp_output_path(&source, &job.id, cache_dir);

    let profile_id = store
        .get_setting("conversion_profile")
        .await?
        .unwrap_or_else(|| "nvenc_max".to_string());
    let audio_codec = store
        .get_setting("audio_codec")
        .await?
        .unwrap_or_else(|| "copy".to_string());

    let profile = profiles::by_id(&profile_id);
    let effective_codec = profiles::effective_codec(profile.video_codec, gpu_mode);
    if effective_codec != profile.video_codec {
        warn!(
            "downgrading {} to {effective_codec} (gpu_mode={gpu_mode})",
            profile.video_codec
        );
    }

    let duration = crate::probe::duration_of(&job.file_path).await;
    let original_size = std::fs::metadata(&source).map(|m| m.len() as i64).unwrap_or(job.file_size);

    store.mark_processing(&job.id, original_size).await?;

    let start = Instant::now();
    let result = spawn_and_supervise(
        store,
        cancel_handles,
        &job.id,
        &source,
        &temp_out,
        effective_codec,
        profile.preset,
        profile.quality,
        &audio_codec,
        duration,
    )
    .await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(()) => finalize_success(store, job, &source, &temp_out, original_size, elapsed).await,
        Err(TranscodeOutcome::Cancelled) => {
            remove_if_present(&temp_out);
            store.delete_job(&job.id).await?;
            Ok(())
        }
        Err(TranscodeOutcome::Failed(msg)) => {
            remove_if_present(&temp_out);
            store
                .add_history(
                    job.library_id.as_deref(),
                    &job.file_path,
                    original_size,
                    0,
                    elapsed,
                    "error",
                    Some(&msg),
                )
                .await?;
            store.delete_job(&job.id).await?;
            Ok(())
        }
    }
}

fn temp_output_path(source: &Path, job_id: &str, cache_dir: Option<&PathBuf>) -> PathBuf {
    let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let short_id = &job_id[..job_id.len().min(8)];
    let filename = format!("{stem}_shrync_{short_id}.mkv");
    match cache_dir {
        Some(dir) => dir.join(filename),
        None => source
            .parent()
            .map(|p| p.join(&filename))
            .unwrap_or_else(|| PathBuf::from(&filename)),
    }
}

enum TranscodeOutcome {
    Cancelled,
    Failed(String),
}

#[allow(clippy::too_many_arguments)]
async fn spawn_and_supervise(
    store: &Store,
    cancel_handles: &CancelHandles,
    job_id: &str,
    source: &Path,
    temp_out: &Path,
    codec: &str,
    preset: &str,
    quality: u32,
    audio_codec: &str,
    duration: f64,
) -> std::result::Result<(), TranscodeOutcome> {
    if let Some(parent) = temp_out.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let is_nvenc = codec.contains("nvenc");
    let mut cmd = Command::new(ffmpeg_bin());
    cmd.arg("-y").arg("-i").arg(source);
    cmd.arg("-c:v").arg(codec).arg("-preset").arg(preset);
    if is_nvenc {
        cmd.arg("-rc").arg("constqp").arg("-qp").arg(quality.to_string()).arg("-b:v").arg("0");
    } else {
        cmd.arg("-crf").arg(quality.to_string());
    }
    cmd.arg("-c:a").arg(audio_codec).arg("-c:s").arg("copy");
    cmd.arg("-progress").arg("pipe:1").arg("-nostats");
    cmd.arg(temp_out);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    info!("starting transcode {job_id}: {source:?} -> {temp_out:?} ({codec}/{preset}/q{quality})");

    let mut child = cmd
        .spawn()
        .map_err(|e| TranscodeOutcome::Failed(format!("ffmpeg returncode: spawn failed: {e}")))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (kill_tx, mut kill_rx) = oneshot::channel();
    {
        let mut guard = cancel_handles.inner.lock().unwrap();
        guard.insert(job_id.to_string(), kill_tx);
    }

    let stderr_tail: Arc<Mutex<VecDeque<String>>> =
        Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let stderr_tail_writer = stderr_tail.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut guard = stderr_tail_writer.lock().unwrap();
            if guard.len() == STDERR_TAIL_LINES {
                guard.pop_front();
            }
            guard.push_back(line);
        }
    });

    let job_id_owned = job_id.to_string();
    let store_progress_id = job_id_owned.clone();
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut killed = false;
    let mut current_out_time_us: Option<i64> = None;

    loop {
        tokio::select! {
            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(frame) = parse_progress_line(&line, duration, &mut current_out_time_us) {
                            let (progress, fps, eta) = frame;
                            let _ = store.update_progress(&store_progress_id, progress, fps, &eta).await;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            _ = &mut kill_rx => {
                warn!("job {job_id_owned} cancelled, killing transcoder");
                let _ = child.kill().await;
                killed = true;
                break;
            }
        }
    }

    let status = child.wait().await.map_err(|e| TranscodeOutcome::Failed(format!("ffmpeg returncode: wait failed: {e}")))?;
    let _ = stderr_task.await;
    cancel_handles.inner.lock().unwrap().remove(job_id);

    if killed {
        return Err(TranscodeOutcome::Cancelled);
    }

    if status.success() && temp_out.exists() {
        return Ok(());
    }

    let tail = stderr_tail.lock().unwrap().iter().cloned().collect::<Vec<_>>().join("\n");
    let msg = if tail.trim().is_empty() {
        format!("ffmpeg returncode: {}", status.code().unwrap_or(-1))
    } else {
        tail.chars().rev().take(1000).collect::<String>().chars().rev().collect()
    };
    Err(TranscodeOutcome::Failed(msg))
}

/// Parses an ffmpeg `-progress pipe:1` key=value frame. Returns `Some` only on an `fps=`
/// line, matching the upstream cadence of committing progress once per frame report.
///
/// The ×25 factor in the eta calculation mirrors the upstream heuristic verbatim and is
/// intentionally not "corrected" — see SPEC_FULL.md §9.
fn parse_progress_line(
    line: &str,
    duration: f64,
    current_out_time_us: &mut Option<i64>,
) -> Option<(i64, f64, String)> {
    if let Some(value) = line.strip_prefix("out_time_us=") {
        if let Ok(us) = value.trim().parse::<i64>() {
            *current_out_time_us = Some(us);
        }
        return None;
    }

    let fps_str = line.strip_prefix("fps=")?;
    let fps: f64 = fps_str.trim().parse().ok()?;
    let out_time_us = (*current_out_time_us)?;
    let current_sec = out_time_us as f64 / 1_000_000.0;

    let progress = if duration > 0.0 {
        ((current_sec / duration) * 100.0).floor().min(99.0) as i64
    } else {
        0
    };

    let eta = if duration > 0.0 && fps > 0.0 {
        let remaining_sec = (((duration - current_sec) / fps) * 25.0).floor().max(0.0) as i64;
        format!("{}m{}s", remaining_sec / 60, remaining_sec % 60)
    } else {
        String::new()
    };

    Some((progress, fps, eta))
}

async fn finalize_success(
    store: &Store,
    job: &QueueJob,
    source: &Path,
    temp_out: &Path,
    original_size: i64,
    elapsed: f64,
) -> Result<()> {
    let new_size = std::fs::metadata(temp_out).map(|m| m.len() as i64).unwrap_or(0);

    if let Err(e) = std::fs::remove_file(source) {
        remove_if_present(temp_out);
        store
            .add_history(
                job.library_id.as_deref(),
                &job.file_path,
                original_size,
                0,
                elapsed,
                "error",
                Some(&format!("Bestand verplaatsen mislukt: {e}")),
            )
            .await?;
        store.delete_job(&job.id).await?;
        return Ok(());
    }

    if let Err(e) = std::fs::rename(temp_out, source) {
        remove_if_present(temp_out);
        store
            .add_history(
                job.library_id.as_deref(),
                &job.file_path,
                original_size,
                0,
                elapsed,
                "error",
                Some(&format!("Bestand verplaatsen mislukt: {e}")),
            )
            .await?;
        store.delete_job(&job.id).await?;
        return Ok(());
    }

    store
        .add_history(
            job.library_id.as_deref(),
            &job.file_path,
            original_size,
            new_size,
            elapsed,
            "success",
            None,
        )
        .await?;
    store.delete_job(&job.id).await?;
    Ok(())
}

fn remove_if_present(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_output_path_uses_cache_dir_when_set() {
        let source = PathBuf::from("/media/movie.mkv");
        let cache = PathBuf::from("/cache");
        let path = temp_output_path(&source, "abcdef1234567890", Some(&cache));
        assert_eq!(path, PathBuf::from("/cache/movie_shrync_abcdef12.mkv"));
    }

    #[test]
    fn temp_output_path_falls_back_to_source_dir() {
        let source = PathBuf::from("/media/movie.mkv");
        let path = temp_output_path(&source, "abcdef1234567890", None);
        assert_eq!(path, PathBuf::from("/media/movie_shrync_abcdef12.mkv"));
    }

    #[test]
    fn cancel_on_unknown_job_is_a_noop() {
        let handles = CancelHandles::new();
        assert!(!handles.cancel("does-not-exist"));
    }

    #[test]
    fn eta_formula_applies_undocumented_multiplier() {
        // duration=100s, current=50s, fps=10 -> remaining=(100-50)/10*25=125s -> 2m5s
        let mut state = None;
        parse_progress_line("out_time_us=50000000", 100.0, &mut state);
        let (_, _, eta) = parse_progress_line("fps=10", 100.0, &mut state).unwrap();
        assert_eq!(eta, "2m5s");
    }
}
