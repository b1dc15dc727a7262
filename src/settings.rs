use std::{path::PathBuf, sync::OnceLock, thread};

use anyhow::Context;
use serde::{Deserialize, Serialize};

static GLOBAL: OnceLock<Settings> = OnceLock::new();

/// Process-wide configuration.
///
/// Evaluation reads a snapshot once per `eval` (via
/// [`EvalContext`](crate::node::EvalContext)); changing the global mid-flight
/// never affects a running evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Evaluate independent sources on worker threads.
    pub multithreading: bool,
    /// Shared thread budget for the whole process.
    pub n_threads: usize,
    /// Cell budget for chunked reductions. `None` reduces in one shot.
    pub chunk_size: Option<usize>,
    pub debug: bool,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_deadline_ms: u64,
    pub cache_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            multithreading: true,
            n_threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            chunk_size: None,
            debug: false,
            retry_max_attempts: 3,
            retry_base_delay_ms: 100,
            retry_deadline_ms: 10_000,
            cache_dir: None,
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> anyhow::Result<Settings> {
        toml::from_str(text).context("failed to parse settings")
    }

    /// Installs `settings` as the process-wide value. Returns `false` if the
    /// global was already initialized (the existing value is kept).
    pub fn init(settings: Settings) -> bool {
        GLOBAL.set(settings).is_ok()
    }

    pub fn global() -> &'static Settings {
        GLOBAL.get_or_init(Settings::default)
    }
}
