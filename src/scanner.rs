//! Walks a library's directory tree and enqueues eligible video files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::AppConfig;
use crate::error::Result;
use crate::profiles;
use crate::probe;
use crate::store::{Library, Store};

pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "m4v", "ts", "wmv", "flv"];

const TEMP_MARKER: &str = "_shrync_";

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScanStatus {
    pub status: String, // idle | scanning | done | error
    pub scanned: u64,
    pub added: u64,
    pub skipped: u64,
    pub already_converted: u64,
    pub current_file: Option<String>,
    pub error: Option<String>,
}

pub type ScanStatusMap = Arc<Mutex<HashMap<String, ScanStatus>>>;

pub fn new_scan_status_map() -> ScanStatusMap {
    Arc::new(Mutex::new(HashMap::new()))
}

fn has_video_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn is_temp_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.contains(TEMP_MARKER))
        .unwrap_or(false)
}

/// Path-prefix comparison against the cache directory, using canonicalised components.
/// REDESIGN FLAG: the distilled spec's substring-containment check is replaced with a real
/// prefix comparison (see SPEC_FULL.md §9).
pub fn is_under_cache_dir(path: &Path, cache_dir: Option<&PathBuf>) -> bool {
    let Some(cache_dir) = cache_dir else {
        return false;
    };
    let canon_cache = cache_dir.canonicalize().unwrap_or_else(|_| cache_dir.clone());
    let canon_path = path
        .parent()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
        .unwrap_or_else(|| path.to_path_buf());
    canon_path.starts_with(&canon_cache)
}

fn set_status(statuses: &ScanStatusMap, library_id: &str, status: ScanStatus) {
    statuses.lock().unwrap().insert(library_id.to_string(), status);
}

/// Scans one library, enqueueing eligible files. Errors reading the root transition the
/// status to `error`; errors on inner directories are skipped, not propagated.
pub async fn scan_library(
    store: &Store,
    config: &AppConfig,
    statuses: &ScanStatusMap,
    library: &Library,
) -> Result<()> {
    let root = PathBuf::from(&library.path);
    if !root.is_dir() {
        set_status(
            statuses,
            &library.id,
            ScanStatus {
                status: "error".to_string(),
                error: Some(format!("not a directory: {}", library.path)),
                ..Default::default()
            },
        );
        return Ok(());
    }

    info!("Scanning library {} at {}", library.name, library.path);
    let mut st = ScanStatus {
        status: "scanning".to_string(),
        ..Default::default()
    };
    set_status(statuses, &library.id, st.clone());

    let cache_dir = config.cache_dir_path();
    let profile = profiles::by_id(
        &store
            .get_setting("conversion_profile")
            .await?
            .unwrap_or_else(|| "nvenc_max".to_string()),
    );
    let family = profiles::family(profile.video_codec);

    let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
        e.file_name()
            .to_str()
            .map(|n| !(e.depth() > 0 && n.starts_with('.')))
            .unwrap_or(true)
    });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("walk error in {}: {e}", library.path);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !has_video_extension(path) {
            continue;
        }

        if is_temp_artifact(path) || is_under_cache_dir(path, cache_dir.as_ref()) {
            continue;
        }

        st.scanned += 1;
        st.current_file = path.to_str().map(|s| s.to_string());
        if st.scanned % 10 == 0 {
            set_status(statuses, &library.id, st.clone());
        }

        let path_str = path.to_string_lossy().to_string();

        if store.path_has_active_job(&path_str).await? || store.has_successful_history(&path_str).await? {
            st.skipped += 1;
            continue;
        }

        let codec = probe::codec_of(&path_str).await;
        if let Some(codec) = &codec {
            if probe::codec_matches_family(codec, family) {
                st.already_converted += 1;
                continue;
            }
        }

        let file_size = entry.metadata().map(|m| m.len() as i64).unwrap_or(0);
        store.enqueue_job(Some(&library.id), &path_str, file_size).await?;
        st.added += 1;
        debug!("enqueued {path_str}");
    }

    store.touch_last_scan(&library.id).await?;
    st.status = "done".to_string();
    st.current_file = None;
    set_status(statuses, &library.id, st);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn video_extension_check_is_case_insensitive() {
        assert!(has_video_extension(Path::new("movie.MKV")));
        assert!(has_video_extension(Path::new("movie.mp4")));
        assert!(!has_video_extension(Path::new("movie.txt")));
    }

    #[test]
    fn temp_artifact_marker_is_detected() {
        assert!(is_temp_artifact(Path::new("foo_shrync_ab12cd34.mkv")));
        assert!(!is_temp_artifact(Path::new("foo.mkv")));
    }

    #[tokio::test]
    async fn scan_library_rejects_nonexistent_path() {
        let store = crate::store::Store::in_memory().await.unwrap();
        let config = AppConfig::default();
        let statuses = new_scan_status_map();
        let library = store
            .create_library("lib", "/no/such/path/xyz", 3600)
            .await
            .unwrap();
        scan_library(&store, &config, &statuses, &library).await.unwrap();
        let snap = statuses.lock().unwrap().get(&library.id).cloned().unwrap();
        assert_eq!(snap.status, "error");
    }

    #[tokio::test]
    async fn scan_library_enqueues_video_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"data").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"data").unwrap();

        let store = crate::store::Store::in_memory().await.unwrap();
        let config = AppConfig::default();
        let statuses = new_scan_status_map();
        let library = store
            .create_library("lib", dir.path().to_str().unwrap(), 3600)
            .await
            .unwrap();

        scan_library(&store, &config, &statuses, &library).await.unwrap();

        let queue = store.list_queue(None).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue[0].file_path.ends_with("clip.mp4"));
    }
}
