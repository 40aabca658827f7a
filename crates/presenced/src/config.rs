use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a capture matches an enrolled person.
    pub match_threshold: f32,
    /// Seconds between template snapshot refreshes.
    pub snapshot_refresh_secs: u64,
    /// Timeout in seconds for ledger and schedule calls.
    pub dependency_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let db_path = std::env::var("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            db_path,
            match_threshold: env_f32(
                "PRESENCE_MATCH_THRESHOLD",
                presence_core::DEFAULT_MATCH_THRESHOLD,
            ),
            snapshot_refresh_secs: env_u64("PRESENCE_SNAPSHOT_REFRESH_SECS", 300),
            dependency_timeout_secs: env_u64("PRESENCE_DEPENDENCY_TIMEOUT_SECS", 5),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
