use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::id::DEFAULT_TEMP_PREFIX;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsyncConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ids: IdConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdConfig {
    #[serde(default = "default_temp_prefix")]
    pub temp_prefix: String,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            temp_prefix: default_temp_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_journal_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl RevsyncConfig {
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            call_timeout: Duration::from_millis(self.retry.call_timeout_ms),
        }
    }

    /// Journal location for a project, or `None` when journaling is off.
    /// Relative paths are resolved against `project_root`.
    #[must_use]
    pub fn journal_path(&self, project_root: &Path) -> Option<PathBuf> {
        self.journal.enabled.then(|| {
            if self.journal.path.is_absolute() {
                self.journal.path.clone()
            } else {
                project_root.join(&self.journal.path)
            }
        })
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.journal.lock_timeout_ms)
    }
}

fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<toml::Table>(&content)
        .map(Some)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(".revsync/config.toml")
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("revsync/config.toml"))
}

pub fn load_project_config(project_root: &Path) -> Result<RevsyncConfig> {
    let path = project_config_path(project_root);
    let Some(table) = read_table(&path)? else {
        return Ok(RevsyncConfig::default());
    };
    table
        .try_into()
        .with_context(|| format!("Invalid settings in {}", path.display()))
}

pub fn load_user_config() -> Result<RevsyncConfig> {
    let Some(path) = user_config_path() else {
        return Ok(RevsyncConfig::default());
    };
    let Some(table) = read_table(&path)? else {
        return Ok(RevsyncConfig::default());
    };
    table
        .try_into()
        .with_context(|| format!("Invalid settings in {}", path.display()))
}

/// Project settings over user settings over defaults, then environment
/// overrides.
pub fn resolve_config(project_root: &Path) -> Result<RevsyncConfig> {
    let user = match user_config_path() {
        Some(path) => read_table(&path)?,
        None => None,
    };
    let project = read_table(&project_config_path(project_root))?;
    let config = layer(user, project).context("Failed to combine user and project config")?;
    apply_env_overrides(config, |key| env::var(key).ok())
}

fn layer(user: Option<toml::Table>, project: Option<toml::Table>) -> Result<RevsyncConfig> {
    let mut merged = user.unwrap_or_default();
    if let Some(project) = project {
        merge_tables(&mut merged, project);
    }
    Ok(merged.try_into()?)
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_section)), toml::Value::Table(section)) => {
                merge_tables(base_section, section);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn apply_env_overrides(
    mut config: RevsyncConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<RevsyncConfig> {
    if let Some(raw) = lookup("REVSYNC_MAX_ATTEMPTS") {
        config.retry.max_attempts = raw
            .trim()
            .parse()
            .with_context(|| format!("REVSYNC_MAX_ATTEMPTS must be a whole number, got '{raw}'"))?;
    }
    if let Some(raw) = lookup("REVSYNC_CALL_TIMEOUT_MS") {
        config.retry.call_timeout_ms = raw.trim().parse().with_context(|| {
            format!("REVSYNC_CALL_TIMEOUT_MS must be milliseconds, got '{raw}'")
        })?;
    }
    Ok(config)
}

const fn default_true() -> bool {
    true
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    250
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

const fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_temp_prefix() -> String {
    DEFAULT_TEMP_PREFIX.to_string()
}

fn default_journal_path() -> PathBuf {
    PathBuf::from(".revsync/queue.json")
}

const fn default_lock_timeout_ms() -> u64 {
    2_000
}
