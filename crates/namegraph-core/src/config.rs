use std::{env, path::Path};

use anyhow::{Context, Result};
use config as cfg;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchySettings {
    /// Maximum depth of the string forest; a root sits at depth 1.
    #[serde(default = "HierarchySettings::default_max_depth")]
    pub max_depth: u32,
}

impl HierarchySettings {
    fn default_max_depth() -> u32 {
        5
    }
}

impl Default for HierarchySettings {
    fn default() -> Self {
        Self {
            max_depth: Self::default_max_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Upper bound on strings committed per storage transaction.
    #[serde(default = "BatchSettings::default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Batches larger than this run as background work and return a
    /// batch id to poll instead of inline results.
    #[serde(default = "BatchSettings::default_sync_threshold")]
    pub sync_threshold: usize,
    #[serde(default = "BatchSettings::default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "BatchSettings::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long a chunk commit may wait on a single row lock.
    #[serde(default = "BatchSettings::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl BatchSettings {
    fn default_max_chunk_size() -> usize {
        100
    }

    fn default_sync_threshold() -> usize {
        50
    }

    fn default_lock_retries() -> u32 {
        3
    }

    fn default_retry_backoff_ms() -> u64 {
        25
    }

    fn default_lock_timeout_ms() -> u64 {
        250
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: Self::default_max_chunk_size(),
            sync_threshold: Self::default_sync_threshold(),
            lock_retries: Self::default_lock_retries(),
            retry_backoff_ms: Self::default_retry_backoff_ms(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationSettings {
    /// Levels a single job may descend below its origin.
    #[serde(default = "PropagationSettings::default_max_levels")]
    pub max_levels: u32,
    /// Errors tolerated before the remaining levels are skipped.
    #[serde(default = "PropagationSettings::default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "PropagationSettings::default_max_level_width")]
    pub max_level_width: usize,
    #[serde(default = "PropagationSettings::default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default = "PropagationSettings::default_max_duration_ms")]
    pub max_duration_ms: u64,
}

impl PropagationSettings {
    fn default_max_levels() -> u32 {
        5
    }

    fn default_error_threshold() -> u32 {
        25
    }

    fn default_max_level_width() -> usize {
        1_000
    }

    fn default_max_nodes() -> usize {
        10_000
    }

    fn default_max_duration_ms() -> u64 {
        30_000
    }
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            max_levels: Self::default_max_levels(),
            error_threshold: Self::default_error_threshold(),
            max_level_width: Self::default_max_level_width(),
            max_nodes: Self::default_max_nodes(),
            max_duration_ms: Self::default_max_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSettings {
    /// Optional freshness bound; `None` relies on explicit invalidation
    /// events alone.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "EngineSettings::default_env")]
    pub env: String,
    #[serde(default)]
    pub hierarchy: HierarchySettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub propagation: PropagationSettings,
    #[serde(default)]
    pub catalog: CatalogSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            env: Self::default_env(),
            hierarchy: HierarchySettings::default(),
            batch: BatchSettings::default(),
            propagation: PropagationSettings::default(),
            catalog: CatalogSettings::default(),
        }
    }
}

impl EngineSettings {
    fn default_env() -> String {
        env::var("APP_ENV")
            .ok()
            .or_else(|| env::var("RUST_ENV").ok())
            .unwrap_or_else(|| "development".to_string())
    }

    /// Load from `./config` (when present) layered with `NAMEGRAPH__*`
    /// environment variables.
    pub fn load() -> Result<Self> {
        let cwd = env::current_dir().unwrap_or_else(|_| ".".into());
        let config_dir = cwd.join("config");
        let settings = Self::load_from_sources(&config_dir, &Self::default_env())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Layered sources, later ones overriding earlier ones:
    /// `default.toml`, `{env}.toml`, `local.toml`, then environment
    /// variables under the `NAMEGRAPH` prefix with `__` separators.
    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<Self> {
        let builder = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(cfg::Environment::with_prefix("NAMEGRAPH").separator("__"));

        let settings: EngineSettings = builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        info!(env = %settings.env, "engine settings loaded");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.hierarchy.max_depth > 0, "hierarchy.max_depth must be > 0");
        anyhow::ensure!(
            self.batch.max_chunk_size > 0,
            "batch.max_chunk_size must be > 0"
        );
        anyhow::ensure!(
            self.batch.sync_threshold <= self.propagation.max_nodes,
            "batch.sync_threshold must not exceed propagation.max_nodes"
        );
        anyhow::ensure!(
            self.propagation.max_levels > 0,
            "propagation.max_levels must be > 0"
        );
        anyhow::ensure!(
            self.propagation.max_level_width > 0,
            "propagation.max_level_width must be > 0"
        );
        anyhow::ensure!(
            self.propagation.max_duration_ms > 0,
            "propagation.max_duration_ms must be > 0"
        );
        Ok(())
    }
}
