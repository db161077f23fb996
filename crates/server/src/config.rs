use crate::runtime::CommandRuntime;
use anyhow::{Context, Result};
use sagaflow_core::storage::{JsonlEventLog, RedbStateStore, StateStore};
use sagaflow_core::{EngineConfig, WorkflowEngine};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Redb,
    Jsonl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_state_file")]
    pub state_file: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,
}

fn default_state_file() -> String {
    "state.redb".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            state_file: default_state_file(),
            event_log_dir: default_event_log_dir(),
        }
    }
}

/// How task actions are executed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory for actions; the server's own when unset
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            working_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
                runtime: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the redb state file path
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn open_store(&self) -> Result<Arc<dyn StateStore>> {
        let store: Arc<dyn StateStore> = match self.storage.backend {
            StorageBackend::Redb => Arc::new(
                RedbStateStore::new(self.state_path()).context("Failed to open redb state store")?,
            ),
            StorageBackend::Jsonl => Arc::new(
                JsonlEventLog::new(self.event_log_path()).context("Failed to create event log")?,
            ),
        };
        Ok(store)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = config.open_store()?;
        tracing::info!("Using {:?} state store", config.storage.backend);

        let runtime = Arc::new(CommandRuntime::new(
            config.runtime.shell.clone(),
            config.runtime.working_dir.clone(),
        ));

        Ok(Self {
            engine: WorkflowEngine::new(store, runtime, config.engine.clone()),
        })
    }
}
