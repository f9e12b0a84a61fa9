//! Configuration for workers, sessions and the task thread pool.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::{AuxThreadError, Result};

/// Environment variable overriding [`AuxThreadConfig::overwrite_policy`].
pub const ENV_OVERWRITE_POLICY: &str = "TA_AUX_OVERWRITE_POLICY";
/// Environment variable overriding [`AuxThreadConfig::call_timeout_ms`].
pub const ENV_CALL_TIMEOUT_MS: &str = "TA_AUX_CALL_TIMEOUT_MS";
/// Environment variable overriding [`AuxThreadConfig::max_task_threads`].
pub const ENV_MAX_TASK_THREADS: &str = "TA_AUX_MAX_TASK_THREADS";

/// What `register_child` does when the parent already has a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Replace the previous child without touching it.
    ///
    /// The caller must have joined the previous child already.
    #[default]
    Keep,
    /// Refuse the registration while the previous child is still running.
    Reject,
    /// Replace the previous child, then cancel and join it.
    CancelPrevious,
}

impl std::str::FromStr for OverwritePolicy {
    type Err = AuxThreadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "reject" => Ok(Self::Reject),
            "cancel_previous" | "cancel-previous" => Ok(Self::CancelPrevious),
            other => Err(AuxThreadError::config(format!(
                "unknown overwrite policy '{other}'"
            ))),
        }
    }
}

/// Configuration shared by the registry, workers, sessions and the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxThreadConfig {
    /// Behaviour of repeated registrations from the same parent.
    #[serde(default)]
    pub overwrite_policy: OverwritePolicy,
    /// Prefix for worker thread names.
    #[serde(default = "default_name_prefix")]
    pub worker_name_prefix: String,
    /// Stack size for worker threads; the platform default when unset.
    #[serde(default)]
    pub worker_stack_size: Option<usize>,
    /// Default timeout for session calls; unbounded when unset.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    /// Number of task thread slots.
    #[serde(default = "default_max_task_threads")]
    pub max_task_threads: usize,
}

fn default_name_prefix() -> String {
    "ta-aux".to_string()
}

fn default_max_task_threads() -> usize {
    16
}

impl Default for AuxThreadConfig {
    fn default() -> Self {
        Self {
            overwrite_policy: OverwritePolicy::default(),
            worker_name_prefix: default_name_prefix(),
            worker_stack_size: None,
            call_timeout_ms: None,
            max_task_threads: default_max_task_threads(),
        }
    }
}

impl AuxThreadConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_vars<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(policy) = lookup(ENV_OVERWRITE_POLICY) {
            self.overwrite_policy = policy.parse()?;
        }
        if let Some(timeout) = lookup(ENV_CALL_TIMEOUT_MS) {
            let ms = timeout.trim().parse::<u64>().map_err(|e| {
                AuxThreadError::config(format!("{ENV_CALL_TIMEOUT_MS}: {e}"))
            })?;
            self.call_timeout_ms = Some(ms);
        }
        if let Some(max) = lookup(ENV_MAX_TASK_THREADS) {
            self.max_task_threads = max.trim().parse::<usize>().map_err(|e| {
                AuxThreadError::config(format!("{ENV_MAX_TASK_THREADS}: {e}"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_task_threads == 0 {
            return Err(AuxThreadError::config("max_task_threads must be positive"));
        }
        if self.worker_name_prefix.contains('\0') {
            return Err(AuxThreadError::config(
                "worker_name_prefix must not contain NUL",
            ));
        }
        Ok(())
    }

    /// Sets the overwrite policy.
    #[must_use]
    pub fn with_overwrite_policy(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite_policy = policy;
        self
    }

    /// Sets the worker name prefix.
    #[must_use]
    pub fn with_worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Sets the worker stack size.
    #[must_use]
    pub fn with_worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = Some(bytes);
        self
    }

    /// Sets the default call timeout.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the number of task thread slots.
    #[must_use]
    pub fn with_max_task_threads(mut self, max: usize) -> Self {
        self.max_task_threads = max;
        self
    }

    /// Gets the default call timeout as a Duration.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}
