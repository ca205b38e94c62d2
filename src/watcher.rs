//! Per-library filesystem watcher. Uses `notify`'s polling backend so that network-mounted
//! library directories are watched reliably, and stabilises newly arrived files (checking
//! that their size hasn't changed across two 10s samples) before enqueueing them.

use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{Result, ShryncError};
use crate::profiles;
use crate::scanner::{self, VIDEO_EXTENSIONS};
use crate::store::{Library, Store};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const STABILITY_WAIT: Duration = Duration::from_secs(10);

/// A running set of watchers, one per enabled library. Replacing the set drops the old
/// `PollWatcher` handles, which stops their background polling.
pub struct WatcherSet {
    handles: Mutex<Vec<PollWatcher>>,
}

impl WatcherSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().unwrap().is_empty()
    }

    fn replace(&self, new_handles: Vec<PollWatcher>) {
        *self.handles.lock().unwrap() = new_handles;
    }
}

/// (Re)starts watchers for every enabled library with a directory that currently exists.
/// Idempotent: any previously running watchers are dropped first.
pub async fn start_watchers(
    store: Arc<Store>,
    config: Arc<AppConfig>,
    set: Arc<WatcherSet>,
) -> Result<()> {
    set.replace(Vec::new());

    let libraries = store.list_libraries().await?;
    let mut handles = Vec::new();

    for library in libraries.into_iter().filter(|l| l.enabled) {
        if !Path::new(&library.path).is_dir() {
            warn!("skipping watcher for {}: path does not exist", library.path);
            continue;
        }
        match spawn_one(&library, store.clone(), config.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!("failed to start watcher for {}: {e}", library.path),
        }
    }

    info!("started {} library watchers", handles.len());
    set.replace(handles);
    Ok(())
}

fn spawn_one(library: &Library, store: Arc<Store>, config: Arc<AppConfig>) -> Result<PollWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
    let extensions: Vec<String> = VIDEO_EXTENSIONS.iter().map(|s| s.to_string()).collect();

    let mut watcher = PollWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in event.paths {
                let is_video = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| extensions.iter().any(|v| v.eq_ignore_ascii_case(e)))
                    .unwrap_or(false);
                if is_video {
                    let _ = tx.send(path);
                }
            }
        },
        Config::default().with_poll_interval(POLL_INTERVAL),
    )
    .map_err(|e| ShryncError::Watch(format!("failed to create watcher: {e}")))?;

    watcher
        .watch(Path::new(&library.path), RecursiveMode::Recursive)
        .map_err(|e| ShryncError::Watch(format!("failed to watch {}: {e}", library.path)))?;

    info!("watching library {} at {}", library.name, library.path);

    let library_id = library.id.clone();
    let cache_dir = config.cache_dir_path();
    let pending: Arc<Mutex<HashMap<PathBuf, Instant>>> = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        while let Some(path) = rx.recv().await {
            if !is_candidate(&path, cache_dir.as_ref()) {
                continue;
            }
            let already_pending = {
                let mut guard = pending.lock().unwrap();
                if guard.contains_key(&path) {
                    true
                } else {
                    guard.insert(path.clone(), Instant::now());
                    false
                }
            };
            if already_pending {
                continue;
            }

            let store = store.clone();
            let library_id = library_id.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                stabilise_and_enqueue(store, library_id, path.clone()).await;
                pending.lock().unwrap().remove(&path);
            });
        }
    });

    Ok(watcher)
}

fn is_candidate(path: &Path, cache_dir: Option<&PathBuf>) -> bool {
    let has_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(e)))
        .unwrap_or(false);
    if !has_ext {
        return false;
    }
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| !n.contains("_shrync_"))
        .unwrap_or(false);
    name_ok && !scanner::is_under_cache_dir(path, cache_dir)
}

/// Waits 10s, samples size, waits another 10s, samples again. If the sizes match the file
/// is considered stable and is enqueued (subject to the usual dedup/codec checks); if they
/// differ the file is still being written and is silently abandoned — the next scan or a
/// later watcher event will pick it up once it settles.
async fn stabilise_and_enqueue(store: Arc<Store>, library_id: String, path: PathBuf) {
    tokio::time::sleep(STABILITY_WAIT).await;
    let Ok(size_1) = std::fs::metadata(&path).map(|m| m.len()) else {
        return;
    };
    tokio::time::sleep(STABILITY_WAIT).await;
    let Ok(size_2) = std::fs::metadata(&path).map(|m| m.len()) else {
        return;
    };
    if size_1 != size_2 {
        debug!("{path:?} still growing, not enqueueing yet");
        return;
    }

    let path_str = path.to_string_lossy().to_string();
    match should_enqueue(&store, &path_str).await {
        Ok(true) => {
            if let Err(e) = store
                .enqueue_job(Some(&library_id), &path_str, size_2 as i64)
                .await
            {
                warn!("failed to auto-enqueue {path_str}: {e}");
            } else {
                info!("auto-enqueued {path_str}");
            }
        }
        Ok(false) => {}
        Err(e) => warn!("dedup check failed for {path_str}: {e}"),
    }
}

async fn should_enqueue(store: &Store, path: &str) -> Result<bool> {
    if store.path_has_active_job(path).await? || store.has_successful_history(path).await? {
        return Ok(false);
    }
    let profile_id = store
        .get_setting("conversion_profile")
        .await?
        .unwrap_or_else(|| "nvenc_max".to_string());
    let profile = profiles::by_id(&profile_id);
    let family = profiles::family(profile.video_codec);
    if let Some(codec) = crate::probe::codec_of(path).await {
        if crate::probe::codec_matches_family(&codec, family) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_rejects_non_video_and_temp_names() {
        assert!(!is_candidate(Path::new("notes.txt"), None));
        assert!(!is_candidate(Path::new("movie_shrync_ab12cd34.mkv"), None));
        assert!(is_candidate(Path::new("movie.mkv"), None));
    }

    #[test]
    fn candidate_rejects_paths_under_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().to_path_buf();
        let file = cache.join("tmp.mkv");
        std::fs::write(&file, b"x").unwrap();
        assert!(!is_candidate(&file, Some(&cache)));
    }
}
