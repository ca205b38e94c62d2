pub mod api;
pub mod config;
pub mod error;
pub mod probe;
pub mod profiles;
pub mod scanner;
pub mod store;
pub mod supervisor;
pub mod transcode;
pub mod watcher;
pub mod worker_pool;

pub use config::AppConfig;
pub use error::{Result, ShryncError};
pub use supervisor::AppState;
