//! Startup recovery, initial scan, watcher liveness monitoring, and worker pool lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::scanner::{self, ScanStatusMap};
use crate::store::Store;
use crate::transcode::CancelHandles;
use crate::watcher::{self, WatcherSet};
use crate::worker_pool::{self, ActiveSlots, WorkerPool};

const WATCHER_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<AppConfig>,
    pub scan_statuses: ScanStatusMap,
    pub watchers: Arc<WatcherSet>,
    pub active_slots: ActiveSlots,
    pub cancel_handles: CancelHandles,
    pub paused: Arc<AtomicBool>,
    pub running: Arc<AtomicBool>,
    pub worker_pool: std::sync::Mutex<Option<WorkerPool>>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> crate::error::Result<Arc<Self>> {
        let store = Arc::new(Store::new(&config.db_path).await?);
        Ok(Arc::new(Self {
            store,
            config: Arc::new(config),
            scan_statuses: scanner::new_scan_status_map(),
            watchers: WatcherSet::new(),
            active_slots: ActiveSlots::new(),
            cancel_handles: CancelHandles::new(),
            paused: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            worker_pool: std::sync::Mutex::new(None),
        }))
    }

    /// Startup recovery, initial scan of enabled libraries, watcher start, watcher monitor,
    /// and worker pool start — in that order, matching the upstream boot sequence.
    pub async fn startup(self: &Arc<Self>) -> crate::error::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.recover_interrupted_jobs().await?;

        for library in self.store.list_libraries().await?.into_iter().filter(|l| l.enabled) {
            if let Err(e) = scanner::scan_library(&self.store, &self.config, &self.scan_statuses, &library).await {
                warn!("initial scan of {} failed: {e}", library.name);
            }
        }

        watcher::start_watchers(self.store.clone(), self.config.clone(), self.watchers.clone()).await?;
        self.spawn_watcher_monitor();
        self.restart_worker_pool().await?;
        Ok(())
    }

    /// Resets any row stuck `processing` back to `pending` and removes its stale temp
    /// artifact, if present.
    async fn recover_interrupted_jobs(&self) -> crate::error::Result<()> {
        let stuck = self.store.reset_interrupted_jobs().await?;
        for job in &stuck {
            let source = std::path::Path::new(&job.file_path);
            let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
            let short_id = &job.id[..job.id.len().min(8)];
            let filename = format!("{stem}_shrync_{short_id}.mkv");
            let candidate = match self.config.cache_dir_path() {
                Some(dir) => dir.join(&filename),
                None => source.parent().map(|p| p.join(&filename)).unwrap_or_else(|| filename.clone().into()),
            };
            if candidate.exists() {
                let _ = std::fs::remove_file(&candidate);
            }
        }
        if !stuck.is_empty() {
            info!("recovered {} interrupted job(s) on startup", stuck.len());
        }
        Ok(())
    }

    fn spawn_watcher_monitor(self: &Arc<Self>) {
        let state = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCHER_MONITOR_INTERVAL).await;
                if !state.running.load(Ordering::SeqCst) {
                    break;
                }
                if state.watchers.is_empty() {
                    warn!("no active watchers detected, restarting");
                    if let Err(e) = watcher::start_watchers(
                        state.store.clone(),
                        state.config.clone(),
                        state.watchers.clone(),
                    )
                    .await
                    {
                        warn!("watcher restart failed: {e}");
                    }
                }
            }
        });
    }

    /// Stops the current worker pool (if any) and starts a new one sized from the
    /// `max_workers` setting.
    pub async fn restart_worker_pool(self: &Arc<Self>) -> crate::error::Result<()> {
        if let Some(pool) = self.worker_pool.lock().unwrap().take() {
            pool.stop();
        }

        let raw = self
            .store
            .get_setting("max_workers")
            .await?
            .unwrap_or_else(|| "1".to_string());
        let count = worker_pool::clamp_worker_count(&raw);

        let pool = worker_pool::spawn(
            self.store.clone(),
            self.config.clone(),
            self.active_slots.clone(),
            self.cancel_handles.clone(),
            self.paused.clone(),
            count,
        );
        *self.worker_pool.lock().unwrap() = Some(pool);
        info!("worker pool started with {count} worker(s)");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(pool) = self.worker_pool.lock().unwrap().take() {
            pool.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recover_interrupted_jobs_is_a_noop_when_queue_is_empty() {
        let config = AppConfig {
            db_path: ":memory:".to_string(),
            ..AppConfig::default()
        };
        let store = Store::in_memory().await.unwrap();
        let state = AppState {
            store: Arc::new(store),
            config: Arc::new(config),
            scan_statuses: scanner::new_scan_status_map(),
            watchers: WatcherSet::new(),
            active_slots: ActiveSlots::new(),
            cancel_handles: CancelHandles::new(),
            paused: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            worker_pool: std::sync::Mutex::new(None),
        };
        assert!(state.recover_interrupted_jobs().await.is_ok());
    }
}
