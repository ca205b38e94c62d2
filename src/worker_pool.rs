//! Bounded pool of worker loops. Each worker repeatedly claims the oldest eligible pending
//! job and runs it to completion; the Active Job Slots map is the only thing that keeps two
//! workers from racing to claim the same row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::store::Store;
use crate::transcode::{self, CancelHandles};

const IDLE_SLEEP: Duration = Duration::from_secs(3);
const ERROR_SLEEP: Duration = Duration::from_secs(5);
const PAUSED_SLEEP: Duration = Duration::from_secs(1);

/// Active Job Slots: worker slot name -> job id currently being processed by that worker.
#[derive(Clone)]
pub struct ActiveSlots {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl ActiveSlots {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn claim(&self, slot: &str, job_id: &str) {
        self.inner.lock().unwrap().insert(slot.to_string(), job_id.to_string());
    }

    fn release(&self, slot: &str) {
        self.inner.lock().unwrap().remove(slot);
    }

    fn active_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().values().cloned().collect()
    }
}

impl Default for ActiveSlots {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Stops all workers at their next idle point. Does not cancel in-flight transcodes.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Spawns `count` worker loops (clamped to [1,3] by the caller via settings).
pub fn spawn(
    store: Arc<Store>,
    config: Arc<AppConfig>,
    slots: ActiveSlots,
    cancel_handles: CancelHandles,
    paused: Arc<AtomicBool>,
    count: usize,
) -> WorkerPool {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(count);

    for i in 0..count.max(1) {
        let slot_name = format!("Worker-{}", i + 1);
        let store = store.clone();
        let config = config.clone();
        let slots = slots.clone();
        let cancel_handles = cancel_handles.clone();
        let paused = paused.clone();
        let stop_flag = stop_flag.clone();

        handles.push(tokio::spawn(async move {
            worker_loop(slot_name, store, config, slots, cancel_handles, paused, stop_flag).await;
        }));
    }

    WorkerPool { handles, stop_flag }
}

/// Reads `max_workers` from settings, clamped to [1,3].
pub fn clamp_worker_count(raw: &str) -> usize {
    raw.parse::<i64>().unwrap_or(1).clamp(1, 3) as usize
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    slot_name: String,
    store: Arc<Store>,
    config: Arc<AppConfig>,
    slots: ActiveSlots,
    cancel_handles: CancelHandles,
    paused: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
) {
    info!("{slot_name} starting");
    while !stop_flag.load(Ordering::SeqCst) {
        if paused.load(Ordering::SeqCst) {
            tokio::time::sleep(PAUSED_SLEEP).await;
            continue;
        }

        let active = slots.active_ids();
        let next = match store.next_pending_excluding(&active).await {
            Ok(job) => job,
            Err(e) => {
                error!("{slot_name}: store error selecting next job: {e}");
                tokio::time::sleep(ERROR_SLEEP).await;
                continue;
            }
        };

        let Some(job) = next else {
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        };

        slots.claim(&slot_name, &job.id);
        let cache_dir = config.cache_dir_path();
        let result = transcode::run_job(&store, &cancel_handles, cache_dir.as_ref(), &config.gpu_mode, &job).await;
        slots.release(&slot_name);

        if let Err(e) = result {
            error!("{slot_name}: unexpected error running job {}: {e}", job.id);
            tokio::time::sleep(ERROR_SLEEP).await;
        }
    }
    info!("{slot_name} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_clamps_to_one_through_three() {
        assert_eq!(clamp_worker_count("0"), 1);
        assert_eq!(clamp_worker_count("1"), 1);
        assert_eq!(clamp_worker_count("3"), 3);
        assert_eq!(clamp_worker_count("5"), 3);
        assert_eq!(clamp_worker_count("not-a-number"), 1);
    }

    #[test]
    fn active_slots_exclude_claimed_job_ids() {
        let slots = ActiveSlots::new();
        slots.claim("Worker-1", "job-a");
        assert_eq!(slots.active_ids(), vec!["job-a".to_string()]);
        slots.release("Worker-1");
        assert!(slots.active_ids().is_empty());
    }
}
