use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

pub const DEFAULT_BIND: &str = ":2222";
pub const DEFAULT_SHELL: &str = "sh";
pub const DEFAULT_WAIT_DELAY: Duration = Duration::from_millis(500);

/// Process-wide startup configuration. Built once, then shared read-only
/// by every session behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Working directory for launched programs; inherit ours when unset.
    pub chdir: Option<PathBuf>,
    /// Start programs with an empty base environment.
    pub no_env: bool,
    /// Extra `KEY=VALUE` assignments, applied last.
    pub env: Vec<String>,
    pub bind: String,
    pub shell: String,
    /// How long output may keep draining after the program exits.
    #[serde(with = "millis")]
    pub wait_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chdir: None,
            no_env: false,
            env: Vec::new(),
            bind: DEFAULT_BIND.to_string(),
            shell: DEFAULT_SHELL.to_string(),
            wait_delay: DEFAULT_WAIT_DELAY,
        }
    }
}

impl Config {
    /// Checks the values and expands a leading `~` in `chdir`.
    pub fn validated(mut self) -> Result<Self> {
        if self.shell.trim().is_empty() {
            return Err(BridgeError::Configuration("shell must not be empty".into()));
        }
        for assignment in &self.env {
            if !assignment.contains('=') {
                return Err(BridgeError::Configuration(format!(
                    "environment assignment {assignment:?} is missing '='"
                )));
            }
        }
        if let Some(dir) = self.chdir.take() {
            self.chdir = Some(expand_home(&dir));
        }
        Ok(self)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
