use crate::component::Descriptor;
use crate::utils::logger::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Whole-engine configuration as loaded by [`crate::utils::config_io::load_cfg`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
    #[serde(default)]
    pub controllers: Vec<Descriptor>,
    #[serde(default)]
    pub components: Vec<Descriptor>,
    #[serde(default)]
    pub channels: Vec<Descriptor>,
    #[serde(default)]
    pub workflows: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    pub worker_threads: usize,
    /// Pause between router fixpoint passes.
    pub router_poll_micros: u64,
    /// Upper bound on one phase, tasks plus routing.
    pub phase_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub router_core_id: Option<usize>,
    /// Core for the thread that runs the controller under [`crate::runtime::Runtime`].
    pub controller_core_id: Option<usize>,
    /// Root for relative paths in component options.
    pub base_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            router_poll_micros: 250,
            phase_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            router_core_id: None,
            controller_core_id: None,
            base_dir: None,
        }
    }
}

/// Process-wide context created once per engine and handed to components
/// while they configure.
#[derive(Debug, Clone, Default)]
pub struct EngineContext {
    pub base_dir: Option<PathBuf>,
}

impl EngineContext {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self { base_dir }
    }

    /// Joins relative paths onto `base_dir`.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}
