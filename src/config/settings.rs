//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`.
//! Every section is `#[serde(default)]`, so a settings file only needs the
//! keys it wants to change.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// How to launch the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable name or path.
    pub program: String,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "voice-sidecar-worker".into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// RpcConfig
// ---------------------------------------------------------------------------

/// Per-method override of the catalog policy.
///
/// There is no fatal-on-timeout field; that flag is fixed per method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodOverride {
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Keyed by method name, e.g. `"system.ping"`.
    pub methods: BTreeMap<String, MethodOverride>,
}

// ---------------------------------------------------------------------------
// SupervisorConfig
// ---------------------------------------------------------------------------

/// Worker health-check, restart backoff and circuit-breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interval between health probes while the worker is ready.
    pub health_interval_ms: u64,
    /// Timeout of a single health probe.
    pub probe_timeout_ms: u64,
    /// Consecutive probe failures that mark the worker unhealthy.
    pub unhealthy_after: u32,
    /// First restart delay.
    pub backoff_base_ms: u64,
    /// Ceiling for the restart delay.
    pub backoff_cap_ms: u64,
    /// Time spent ready after which backoff and breaker are reset.
    pub healthy_reset_secs: u64,
    /// Restarts allowed inside `breaker_window_secs` before giving up.
    pub breaker_max_restarts: u32,
    pub breaker_window_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 5_000,
            probe_timeout_ms: 1_000,
            unhealthy_after: 2,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            healthy_reset_secs: 60,
            breaker_max_restarts: 5,
            breaker_window_secs: 300,
        }
    }
}

impl SupervisorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn healthy_reset(&self) -> Duration {
        Duration::from_secs(self.healthy_reset_secs)
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_secs(self.breaker_window_secs)
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

/// Notification name normalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Accept the `event.*` names older workers emit.
    pub legacy_aliases: bool,
    /// Additional `alias = "canonical"` pairs.
    pub aliases: BTreeMap<String, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            legacy_aliases: true,
            aliases: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Transcripts kept in memory; oldest are dropped first.
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { history_limit: 100 }
    }
}

// ---------------------------------------------------------------------------
// ArtifactConfig
// ---------------------------------------------------------------------------

/// One downloadable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Directory name under the models dir, e.g. `"whisper-base"`.
    pub id: String,
    /// Download URL of the single weights file.
    pub url: String,
    /// File name inside the artifact directory.
    pub file_name: String,
    /// Lower-case hex SHA-256 of the file.
    pub sha256: String,
    /// Expected size in bytes.
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Overrides [`AppPaths::models_dir`].
    pub models_dir: Option<PathBuf>,
    /// Artifacts the host can fetch itself when the worker cannot.
    pub catalog: Vec<ArtifactEntry>,
}

impl ArtifactConfig {
    pub fn find(&self, id: &str) -> Option<&ArtifactEntry> {
        self.catalog.iter().find(|e| e.id == id)
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use voice_sidecar::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    pub rpc: RpcConfig,
    pub supervisor: SupervisorConfig,
    pub dispatch: DispatchConfig,
    pub session: SessionConfig,
    pub artifacts: ArtifactConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Effective artifact directory.
    pub fn models_dir(&self) -> PathBuf {
        self.artifacts
            .models_dir
            .clone()
            .unwrap_or_else(|| AppPaths::new().models_dir)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
