use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use tracing::debug;

use crate::config::Config;

/// Ordered environment where a later assignment replaces an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(OsString, OsString)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of our own process environment.
    pub fn inherited() -> Self {
        let mut env = Self::new();
        for (key, value) in std::env::vars_os() {
            env.set(key, value);
        }
        env
    }

    pub fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        let key = key.into();
        self.vars.retain(|(existing, _)| !same_key(existing, &key));
        self.vars.push((key, value.into()));
    }

    /// Applies `KEY=VALUE` assignments in order. Anything else is skipped.
    pub fn apply<S: AsRef<str>>(&mut self, assignments: &[S]) {
        for assignment in assignments {
            let assignment = assignment.as_ref();
            match assignment.split_once('=') {
                Some((key, value)) if !key.is_empty() => self.set(key, value),
                _ => debug!("Ignoring malformed environment assignment {:?}", assignment),
            }
        }
    }

    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        let key = key.as_ref();
        self.vars
            .iter()
            .find(|(existing, _)| same_key(existing, key))
            .map(|(_, value)| value.as_os_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn same_key(a: &OsStr, b: &OsStr) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// Everything needed to start one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// `argv[0]` is the program.
    pub argv: Vec<String>,
    pub env: Environment,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    /// Merges the environment: inherited (unless disabled), then the
    /// session's own assignments and terminal type, then the configured
    /// extras.
    pub fn new(argv: Vec<String>, config: &Config, session_env: &[String], term: Option<&str>) -> Self {
        let mut env = if config.no_env {
            Environment::new()
        } else {
            Environment::inherited()
        };
        env.apply(session_env);
        if let Some(term) = term {
            env.set("TERM", term);
        }
        env.apply(&config.env);

        Self {
            argv,
            env,
            cwd: config.chdir.clone(),
        }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}
