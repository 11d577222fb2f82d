use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::instance::LifecycleSettings;
use crate::registry::RegistrySettings;
use crate::storage::StorageSettings;

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [storage]
//                    redis_url = "redis://127.0.0.1:6379/"
//
//   env var:         OVERSEER_STORAGE__REDIS_URL=redis://127.0.0.1:6379/
//
//   (double underscore = nesting; single underscore stays within field names)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub storage: StorageFileConfig,
    #[serde(default)]
    pub instances: InstancesFileConfig,
}

/// Persistence backend selection (lives under `[storage]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageFileConfig {
    /// Empty selects the local-file backend
    #[serde(default)]
    pub redis_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl Default for StorageFileConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

/// Instance lifecycle knobs (lives under `[instances]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstancesFileConfig {
    /// Root for default working directories. Defaults to `<data_dir>/InstanceData`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for InstancesFileConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            stop_timeout_secs: default_stop_timeout_secs(),
            kill_timeout_secs: default_kill_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            restart_delay_secs: default_restart_delay_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_operation_timeout_secs() -> u64 {
    10
}
fn default_stop_timeout_secs() -> u64 {
    30
}
fn default_kill_timeout_secs() -> u64 {
    5
}
fn default_shutdown_timeout_secs() -> u64 {
    60
}
fn default_restart_delay_secs() -> u64 {
    3
}
fn default_event_capacity() -> usize {
    1024
}

/// Build a figment that layers: defaults → config.toml → OVERSEER_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `OVERSEER_STORAGE__REDIS_URL=...`  →  `storage.redis_url = "..."`
///   `OVERSEER_INSTANCES__STOP_TIMEOUT_SECS=10`  →  `instances.stop_timeout_secs = 10`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("OVERSEER_").split("__"))
}

// =============================================================================
// Runtime views (derived from FileConfig, handed to the engine)
// =============================================================================

impl StorageSettings {
    pub fn from_file(fc: &StorageFileConfig, paths: &DaemonPaths) -> Self {
        Self {
            data_dir: paths.storage_dir.clone(),
            redis_url: fc.redis_url.trim().to_string(),
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs),
            operation_timeout: Duration::from_secs(fc.operation_timeout_secs),
        }
    }
}

impl LifecycleSettings {
    pub fn from_file(fc: &InstancesFileConfig) -> Self {
        Self {
            stop_timeout: Duration::from_secs(fc.stop_timeout_secs),
            kill_timeout: Duration::from_secs(fc.kill_timeout_secs),
            restart_delay: Duration::from_secs(fc.restart_delay_secs),
            event_capacity: fc.event_capacity.max(1),
        }
    }
}

impl RegistrySettings {
    pub fn from_file(fc: &InstancesFileConfig, paths: &DaemonPaths) -> Self {
        Self {
            instance_data_dir: fc
                .data_dir
                .clone()
                .unwrap_or_else(|| paths.instance_data_dir.clone()),
            lifecycle: LifecycleSettings::from_file(fc),
            shutdown_timeout: Duration::from_secs(fc.shutdown_timeout_secs),
        }
    }
}

// =============================================================================
// Directory layout (not tunable via figment — derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DaemonPaths {
    pub data_dir: PathBuf,
    /// Local-file backend root, one subdirectory per category
    pub storage_dir: PathBuf,
    pub instance_data_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl DaemonPaths {
    /// Resolve the layout without touching the filesystem
    pub fn resolve(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".overseer"),
        };
        Ok(Self {
            storage_dir: data_dir.join("storage"),
            instance_data_dir: data_dir.join("InstanceData"),
            logs_dir: data_dir.join("logs"),
            data_dir,
        })
    }

    /// Resolve and create the layout. Failure here is fatal for the daemon.
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let paths = Self::resolve(custom_dir)?;
        paths.create()?;
        info!("Data directory: {}", paths.data_dir.display());
        Ok(paths)
    }

    fn create(&self) -> Result<()> {
        for dir in [
            &self.data_dir,
            &self.storage_dir,
            &self.instance_data_dir,
            &self.logs_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {:?}", dir))?;
        }
        Ok(())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_storage_file_config_defaults() {
        let d = StorageFileConfig::default();
        assert!(d.redis_url.is_empty());
        assert_eq!(d.connect_timeout_secs, 5);
        assert_eq!(d.operation_timeout_secs, 10);
    }

    #[test]
    fn test_instances_file_config_defaults() {
        let d = InstancesFileConfig::default();
        assert!(d.data_dir.is_none());
        assert_eq!(d.stop_timeout_secs, 30);
        assert_eq!(d.kill_timeout_secs, 5);
        assert_eq!(d.shutdown_timeout_secs, 60);
        assert_eq!(d.restart_delay_secs, 3);
        assert_eq!(d.event_capacity, 1024);
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_without_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert!(fc.storage.redis_url.is_empty());
        assert_eq!(fc.instances.stop_timeout_secs, 30);
    }

    #[test]
    fn test_load_config_reads_toml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[storage]\nredis_url = \"redis://10.0.0.2/\"\n\n[instances]\nstop_timeout_secs = 12\n",
        )
        .unwrap();

        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.storage.redis_url, "redis://10.0.0.2/");
        assert_eq!(fc.storage.connect_timeout_secs, 5);
        assert_eq!(fc.instances.stop_timeout_secs, 12);
        assert_eq!(fc.instances.kill_timeout_secs, 5);
    }

    // ── runtime views ───────────────────────────────────────────────────

    #[test]
    fn test_runtime_views_from_file() {
        let paths = DaemonPaths::resolve(Some(PathBuf::from("/srv/overseer"))).unwrap();
        let fc = FileConfig {
            storage: StorageFileConfig {
                redis_url: "  redis://h/  ".into(),
                ..Default::default()
            },
            instances: InstancesFileConfig {
                stop_timeout_secs: 7,
                event_capacity: 0,
                ..Default::default()
            },
        };

        let storage = StorageSettings::from_file(&fc.storage, &paths);
        assert_eq!(storage.redis_url, "redis://h/");
        assert_eq!(storage.data_dir, PathBuf::from("/srv/overseer/storage"));
        assert_eq!(storage.operation_timeout, Duration::from_secs(10));

        let registry = RegistrySettings::from_file(&fc.instances, &paths);
        assert_eq!(
            registry.instance_data_dir,
            PathBuf::from("/srv/overseer/InstanceData")
        );
        assert_eq!(registry.lifecycle.stop_timeout, Duration::from_secs(7));
        assert_eq!(registry.lifecycle.event_capacity, 1);
        assert_eq!(registry.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_instance_data_dir_override() {
        let paths = DaemonPaths::resolve(Some(PathBuf::from("/srv/overseer"))).unwrap();
        let fc = InstancesFileConfig {
            data_dir: Some(PathBuf::from("/data/instances")),
            ..Default::default()
        };
        let registry = RegistrySettings::from_file(&fc, &paths);
        assert_eq!(registry.instance_data_dir, PathBuf::from("/data/instances"));
    }

    // ── DaemonPaths ─────────────────────────────────────────────────────

    #[test]
    fn test_daemon_paths_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::new(Some(tmp.path().to_path_buf())).unwrap();

        assert_eq!(paths.data_dir, tmp.path());
        assert!(paths.storage_dir.is_dir());
        assert!(paths.instance_data_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
        assert_eq!(paths.config_toml_path(), tmp.path().join("config.toml"));
    }
}
