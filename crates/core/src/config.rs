use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub export: ExportSettings,
    pub status_store: StatusStoreConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `STUPID_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("STUPID_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let storage = StorageConfig::from_env_profiled(p);
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            export: ExportSettings::from_env_profiled(p, &storage),
            status_store: StatusStoreConfig::from_env_profiled(p),
            storage,
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the export pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.export.validate()?;
        self.status_store.validate()
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:       port={}", self.server.port);
        tracing::info!("  storage:      data_dir={}", self.storage.data_dir.display());
        tracing::info!(
            "  export:       dir={}, retention={}d, cleanup_every={}s",
            self.export.export_dir.display(),
            self.export.retention_days,
            self.export.cleanup_interval_secs
        );
        tracing::info!(
            "  status_store: backend={}, ttl={}s",
            self.status_store.backend,
            self.export.status_ttl_secs
        );
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "server": { "host": self.server.host, "port": self.server.port },
            "storage": {
                "data_dir": self.storage.data_dir,
                "records_dir": self.storage.records_dir,
            },
            "export": {
                "export_dir": self.export.export_dir,
                "file_prefix": self.export.file_prefix,
                "retention_days": self.export.retention_days,
                "cleanup_interval_secs": self.export.cleanup_interval_secs,
                "status_ttl_secs": self.export.status_ttl_secs,
                "default_batch_size": self.export.default_batch_size,
                "max_batch_size": self.export.max_batch_size,
            },
            "status_store": {
                "backend": self.status_store.backend,
                "redis_configured": self.status_store.redis_url.is_some(),
            },
        })
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "PORT", 3001),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Directory of `*.jsonl` files served by the bundled record source.
    pub records_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        let data_dir = PathBuf::from(profiled_env_or(p, "DATA_DIR", "data"));
        let records_dir = PathBuf::from(profiled_env_or(
            p,
            "RECORDS_DIR",
            data_dir.join("records").to_str().unwrap_or("data/records"),
        ));
        Self {
            data_dir,
            records_dir,
        }
    }
}

// ── Export pipeline ───────────────────────────────────────────

pub const DEFAULT_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_CLEANUP_RETRY_SECS: u64 = 60 * 60;
pub const DEFAULT_STATUS_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    /// Directory holding finished (and in-flight `.partial`) artifacts.
    pub export_dir: PathBuf,
    /// Leading component of every artifact filename.
    pub file_prefix: String,
    /// Artifacts older than this are swept.
    pub retention_days: u32,
    pub cleanup_interval_secs: u64,
    /// Delay before retrying a sweep that failed outright.
    pub cleanup_retry_secs: u64,
    /// TTL applied to every status record write.
    pub status_ttl_secs: u64,
    pub default_batch_size: usize,
    pub max_batch_size: usize,
}

impl ExportSettings {
    fn from_env_profiled(p: &str, storage: &StorageConfig) -> Self {
        let export_dir = PathBuf::from(profiled_env_or(
            p,
            "EXPORT_DIR",
            storage.data_dir.join("exports").to_str().unwrap_or("data/exports"),
        ));
        Self {
            export_dir,
            file_prefix: profiled_env_or(p, "EXPORT_FILE_PREFIX", "export"),
            retention_days: profiled_env_u32(p, "EXPORT_RETENTION_DAYS", DEFAULT_RETENTION_DAYS),
            cleanup_interval_secs: profiled_env_u64(
                p,
                "EXPORT_CLEANUP_INTERVAL_SECS",
                DEFAULT_CLEANUP_INTERVAL_SECS,
            ),
            cleanup_retry_secs: profiled_env_u64(
                p,
                "EXPORT_CLEANUP_RETRY_SECS",
                DEFAULT_CLEANUP_RETRY_SECS,
            ),
            status_ttl_secs: profiled_env_u64(p, "EXPORT_STATUS_TTL_SECS", DEFAULT_STATUS_TTL_SECS),
            default_batch_size: profiled_env_u64(
                p,
                "EXPORT_DEFAULT_BATCH_SIZE",
                DEFAULT_BATCH_SIZE as u64,
            ) as usize,
            max_batch_size: profiled_env_u64(
                p,
                "EXPORT_MAX_BATCH_SIZE",
                DEFAULT_MAX_BATCH_SIZE as u64,
            ) as usize,
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days as u64 * 24 * 60 * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn cleanup_retry(&self) -> Duration {
        Duration::from_secs(self.cleanup_retry_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file_prefix.is_empty() || self.file_prefix.contains(['/', '\\', '_']) {
            return Err(ConfigError::Invalid(format!(
                "EXPORT_FILE_PREFIX must be non-empty and contain no '/', '\\' or '_': {:?}",
                self.file_prefix
            )));
        }
        if self.retention_days == 0 {
            return Err(ConfigError::Invalid("EXPORT_RETENTION_DAYS must be at least 1".into()));
        }
        if self.cleanup_interval_secs == 0 || self.cleanup_retry_secs == 0 {
            return Err(ConfigError::Invalid("cleanup intervals must be positive".into()));
        }
        if self.status_ttl_secs == 0 {
            return Err(ConfigError::Invalid("EXPORT_STATUS_TTL_SECS must be positive".into()));
        }
        if self.default_batch_size == 0 || self.default_batch_size > self.max_batch_size {
            return Err(ConfigError::Invalid(format!(
                "EXPORT_DEFAULT_BATCH_SIZE must be in 1..={}",
                self.max_batch_size
            )));
        }
        Ok(())
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("data/exports"),
            file_prefix: "export".to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            cleanup_retry_secs: DEFAULT_CLEANUP_RETRY_SECS,
            status_ttl_secs: DEFAULT_STATUS_TTL_SECS,
            default_batch_size: DEFAULT_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

// ── Status store ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusStoreConfig {
    /// "memory" or "redis"
    pub backend: String,
    #[serde(skip_serializing)]
    pub redis_url: Option<String>,
}

impl StatusStoreConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            backend: profiled_env_or(p, "STATUS_STORE_BACKEND", "memory").to_lowercase(),
            redis_url: profiled_env_opt(p, "REDIS_URL"),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend.as_str() {
            "memory" => Ok(()),
            "redis" if self.redis_url.is_some() => Ok(()),
            "redis" => Err(ConfigError::Invalid(
                "STATUS_STORE_BACKEND=redis requires REDIS_URL".into(),
            )),
            other => Err(ConfigError::Invalid(format!(
                "unknown status store backend '{}' (supported: memory, redis)",
                other
            ))),
        }
    }
}
