//! Durable state: libraries, queue jobs, history, settings.
//!
//! Backed by a single SQLite file accessed through a pooled connection. Each logical
//! operation below acquires its own connection from the pool rather than holding one across
//! an `.await` on a subprocess, matching the teacher crate's `Db` discipline.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, ShryncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Error => "error",
        }
    }
}

impl FromStr for JobStatus {
    type Err = ShryncError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "error" => Ok(Self::Error),
            other => Err(ShryncError::BadRequest(format!("unknown job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Library {
    pub id: String,
    pub name: String,
    pub path: String,
    pub enabled: bool,
    pub scan_interval: i64,
    pub last_scan: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueJob {
    pub id: String,
    pub library_id: Option<String>,
    pub file_path: String,
    pub file_size: i64,
    pub status: String,
    pub progress: i64,
    pub fps: f64,
    pub eta: String,
    pub added_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error_msg: Option<String>,
    pub original_size: i64,
    pub new_size: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub library_id: Option<String>,
    pub file_path: String,
    pub original_size: i64,
    pub new_size: i64,
    pub duration_seconds: f64,
    pub status: String,
    pub error_msg: Option<String>,
    pub finished_at: String,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(opts).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(opts).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS libraries (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                scan_interval INTEGER NOT NULL DEFAULT 3600,
                last_scan TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id TEXT PRIMARY KEY,
                library_id TEXT,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                fps REAL NOT NULL DEFAULT 0,
                eta TEXT NOT NULL DEFAULT '',
                added_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                error_msg TEXT,
                original_size INTEGER NOT NULL DEFAULT 0,
                new_size INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                id TEXT PRIMARY KEY,
                library_id TEXT,
                file_path TEXT NOT NULL,
                original_size INTEGER NOT NULL DEFAULT 0,
                new_size INTEGER NOT NULL DEFAULT 0,
                duration_seconds REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error_msg TEXT,
                finished_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (k, v) in [
            ("max_workers", "1"),
            ("language", "en"),
            ("conversion_profile", "nvenc_max"),
            ("audio_codec", "copy"),
        ] {
            sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
                .bind(k)
                .bind(v)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    // ---- libraries ----

    pub async fn create_library(&self, name: &str, path: &str, scan_interval: i64) -> Result<Library> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO libraries (id, name, path, enabled, scan_interval) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(path)
        .bind(scan_interval)
        .execute(&self.pool)
        .await?;
        self.get_library(&id).await
    }

    pub async fn get_library(&self, id: &str) -> Result<Library> {
        sqlx::query_as::<_, Library>("SELECT * FROM libraries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ShryncError::LibraryNotFound(id.to_string()))
    }

    pub async fn list_libraries(&self) -> Result<Vec<Library>> {
        Ok(sqlx::query_as::<_, Library>("SELECT * FROM libraries ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn update_library(
        &self,
        id: &str,
        name: &str,
        path: &str,
        enabled: bool,
        scan_interval: i64,
    ) -> Result<Library> {
        sqlx::query(
            "UPDATE libraries SET name = ?, path = ?, enabled = ?, scan_interval = ? WHERE id = ?",
        )
        .bind(name)
        .bind(path)
        .bind(enabled)
        .bind(scan_interval)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_library(id).await
    }

    /// Does not cascade to queue/history rows, matching the upstream behaviour.
    pub async fn delete_library(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM libraries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_last_scan(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE libraries SET last_scan = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- queue ----

    pub async fn path_has_active_job(&self, file_path: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM queue WHERE file_path = ? AND status IN ('pending','processing') LIMIT 1",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn has_successful_history(&self, file_path: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM history WHERE file_path = ? AND status = 'success' LIMIT 1",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn enqueue_job(
        &self,
        library_id: Option<&str>,
        file_path: &str,
        file_size: i64,
    ) -> Result<QueueJob> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO queue (id, library_id, file_path, file_size, status, added_at) \
             VALUES (?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&id)
        .bind(library_id)
        .bind(file_path)
        .bind(file_size)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        self.get_job(&id).await
    }

    pub async fn get_job(&self, id: &str) -> Result<QueueJob> {
        sqlx::query_as::<_, QueueJob>("SELECT * FROM queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ShryncError::JobNotFound(id.to_string()))
    }

    pub async fn list_queue(&self, status: Option<&str>) -> Result<Vec<QueueJob>> {
        let jobs = match status {
            Some(s) => {
                sqlx::query_as::<_, QueueJob>(
                    "SELECT * FROM queue WHERE status = ? ORDER BY added_at ASC LIMIT 200",
                )
                .bind(s)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, QueueJob>(
                    "SELECT * FROM queue WHERE status IN ('pending','processing','error') \
                     ORDER BY status DESC, added_at ASC LIMIT 200",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    /// Oldest pending job whose id is not in `exclude`, matching worker-pool slot exclusion.
    pub async fn next_pending_excluding(&self, exclude: &[String]) -> Result<Option<QueueJob>> {
        if exclude.is_empty() {
            return Ok(sqlx::query_as::<_, QueueJob>(
                "SELECT * FROM queue WHERE status = 'pending' ORDER BY added_at ASC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?);
        }
        let placeholders = exclude.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT * FROM queue WHERE status = 'pending' AND id NOT IN ({placeholders}) \
             ORDER BY added_at ASC LIMIT 1"
        );
        let mut q = sqlx::query_as::<_, QueueJob>(&sql);
        for id in exclude {
            q = q.bind(id);
        }
        Ok(q.fetch_optional(&self.pool).await?)
    }

    pub async fn mark_processing(&self, id: &str, original_size: i64) -> Result<()> {
        sqlx::query(
            "UPDATE queue SET status = 'processing', started_at = ?, original_size = ?, \
             progress = 0, fps = 0, eta = '' WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(original_size)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_progress(&self, id: &str, progress: i64, fps: f64, eta: &str) -> Result<()> {
        sqlx::query("UPDATE queue SET progress = ?, fps = ?, eta = ? WHERE id = ?")
            .bind(progress)
            .bind(fps)
            .bind(eta)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_job(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Startup recovery: any row stuck `processing` goes back to `pending`.
    pub async fn reset_interrupted_jobs(&self) -> Result<Vec<QueueJob>> {
        let stuck = sqlx::query_as::<_, QueueJob>("SELECT * FROM queue WHERE status = 'processing'")
            .fetch_all(&self.pool)
            .await?;
        sqlx::query(
            "UPDATE queue SET status = 'pending', progress = 0, fps = 0, eta = '', started_at = NULL \
             WHERE status = 'processing'",
        )
        .execute(&self.pool)
        .await?;
        Ok(stuck)
    }

    // ---- history ----

    pub async fn add_history(
        &self,
        library_id: Option<&str>,
        file_path: &str,
        original_size: i64,
        new_size: i64,
        duration_seconds: f64,
        status: &str,
        error_msg: Option<&str>,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO history (id, library_id, file_path, original_size, new_size, \
             duration_seconds, status, error_msg, finished_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(library_id)
        .bind(file_path)
        .bind(original_size)
        .bind(new_size)
        .bind(duration_seconds)
        .bind(status)
        .bind(error_msg)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_successes(&self, limit: i64) -> Result<Vec<HistoryEntry>> {
        Ok(sqlx::query_as::<_, HistoryEntry>(
            "SELECT * FROM history WHERE status = 'success' ORDER BY finished_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn history_page(&self, page: i64, per_page: i64) -> Result<(Vec<HistoryEntry>, i64)> {
        let offset = (page.max(1) - 1) * per_page;
        let items = sqlx::query_as::<_, HistoryEntry>(
            "SELECT * FROM history ORDER BY finished_at DESC LIMIT ? OFFSET ?",
        )
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM history")
            .fetch_one(&self.pool)
            .await?;
        Ok((items, total))
    }

    pub async fn all_successes(&self) -> Result<Vec<HistoryEntry>> {
        Ok(sqlx::query_as::<_, HistoryEntry>(
            "SELECT * FROM history WHERE status = 'success' ORDER BY finished_at ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn clear_history(&self) -> Result<()> {
        sqlx::query("DELETE FROM history").execute(&self.pool).await?;
        Ok(())
    }

    // ---- settings ----

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_settings(&self) -> Result<Vec<(String, String)>> {
        Ok(sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?)
    }

    // ---- stats ----

    pub async fn count_by_status(&self, status: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue WHERE status = ?")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_successes_today(&self) -> Result<i64> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM history WHERE status = 'success' AND finished_at LIKE ?",
        )
        .bind(format!("{today}%"))
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    pub async fn count_errors(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM history WHERE status = 'error'")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn total_bytes_saved(&self) -> Result<i64> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(original_size - new_size) FROM history WHERE status = 'success'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.unwrap_or(0))
    }

    pub async fn active_library_count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM libraries WHERE enabled = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_and_fetch_roundtrip() {
        let store = Store::in_memory().await.unwrap();
        let job = store.enqueue_job(None, "/media/a.mkv", 1024).await.unwrap();
        assert_eq!(job.status, "pending");
        let fetched = store.get_job(&job.id).await.unwrap();
        assert_eq!(fetched.file_path, "/media/a.mkv");
    }

    #[tokio::test]
    async fn reset_interrupted_jobs_clears_processing_state() {
        let store = Store::in_memory().await.unwrap();
        let job = store.enqueue_job(None, "/media/b.mkv", 2048).await.unwrap();
        store.mark_processing(&job.id, 2048).await.unwrap();
        store.update_progress(&job.id, 42, 30.0, "1m0s").await.unwrap();

        let stuck = store.reset_interrupted_jobs().await.unwrap();
        assert_eq!(stuck.len(), 1);

        let reset = store.get_job(&job.id).await.unwrap();
        assert_eq!(reset.status, "pending");
        assert_eq!(reset.progress, 0);
        assert!(reset.started_at.is_none());
    }

    #[tokio::test]
    async fn next_pending_excluding_skips_active_ids() {
        let store = Store::in_memory().await.unwrap();
        let a = store.enqueue_job(None, "/media/a.mkv", 1).await.unwrap();
        let _b = store.enqueue_job(None, "/media/b.mkv", 1).await.unwrap();

        let picked = store.next_pending_excluding(&[a.id.clone()]).await.unwrap().unwrap();
        assert_ne!(picked.id, a.id);
    }

    #[tokio::test]
    async fn settings_default_seed_present() {
        let store = Store::in_memory().await.unwrap();
        assert_eq!(store.get_setting("max_workers").await.unwrap().as_deref(), Some("1"));
        store.set_setting("max_workers", "3").await.unwrap();
        assert_eq!(store.get_setting("max_workers").await.unwrap().as_deref(), Some("3"));
    }
}
