use presence_core::ledger::{LedgerConfig, DEFAULT_TOGGLE_ATTEMPTS};
use presence_core::liveness::{
    LivenessConfig, DEFAULT_CHALLENGE_STEPS, DEFAULT_CHALLENGE_TIMEOUT, DEFAULT_MOTION_THRESHOLD,
};
use presence_core::matcher::{MatcherConfig, DEFAULT_MATCH_THRESHOLD};
use presence_core::service::ServiceConfig;
use std::path::PathBuf;
use std::time::Duration;

/// CLI configuration, loaded from environment variables.
#[derive(Debug)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine distance below which a probe matches an identity.
    pub match_threshold: f32,
    /// Attempts per attendance toggle before a write race is reported.
    pub toggle_attempts: u32,
    /// Minimum frame motion for a liveness step to count.
    pub motion_threshold: f32,
    /// Time allowed to finish a liveness challenge.
    pub liveness_timeout_secs: u64,
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
            .unwrap_or_else(|_| data_dir.join("presence.db"));

        Self {
            db_path,
            match_threshold: env_f32("PRESENCE_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            toggle_attempts: env_u32("PRESENCE_TOGGLE_ATTEMPTS", DEFAULT_TOGGLE_ATTEMPTS),
            motion_threshold: env_f32("PRESENCE_MOTION_THRESHOLD", DEFAULT_MOTION_THRESHOLD),
            liveness_timeout_secs: env_u64(
                "PRESENCE_LIVENESS_TIMEOUT_SECS",
                DEFAULT_CHALLENGE_TIMEOUT.as_secs(),
            ),
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            matcher: MatcherConfig {
                threshold: self.match_threshold,
            },
            ledger: LedgerConfig {
                max_attempts: self.toggle_attempts,
            },
            ..ServiceConfig::default()
        }
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            steps: DEFAULT_CHALLENGE_STEPS,
            timeout: Duration::from_secs(self.liveness_timeout_secs),
            motion_threshold: self.motion_threshold,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
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
