//! Agent configuration management.
//!
//! Reads/writes JSON at `~/.config/chunkmerge/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chunkmerge_protocol::constants::{DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};
use chunkmerge_protocol::DEFAULT_CHUNK_FOLDER;
use chunkmerge_transfer::{
    DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF, MergeOptions, RetryPolicy,
};
use chunkmerge_upload_server::{CoordinatorConfig, MergeDispatch};

/// On-disk config format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    storage_root: String,
    #[serde(default)]
    chunk_folder: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    output_dir: String,
    #[serde(default)]
    max_merge_attempts: u32,
    #[serde(default)]
    initial_backoff_ms: u64,
    #[serde(default)]
    max_backoff_ms: u64,
    #[serde(default)]
    require_complete: bool,
    #[serde(default)]
    merge_dispatch: MergeDispatch,
    #[serde(default)]
    default_buffer_size: u32,
}

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub storage_root: PathBuf,
    pub chunk_folder: String,
    pub output_dir: Option<PathBuf>,
    pub max_merge_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub require_complete: bool,
    pub merge_dispatch: MergeDispatch,
    pub default_buffer_size: u32,
    #[serde(skip)]
    file_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("."),
            chunk_folder: DEFAULT_CHUNK_FOLDER.into(),
            output_dir: None,
            max_merge_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF.as_millis() as u64,
            max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
            require_complete: false,
            merge_dispatch: MergeDispatch::Inline,
            default_buffer_size: DEFAULT_BUFFER_SIZE as u32,
            file_path: config_file_path().unwrap_or_else(|_| PathBuf::from("/tmp/config.json")),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from the default location.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(config_file_path()?)
    }

    /// Loads configuration from `file_path`. A missing file yields defaults.
    pub fn load_from(file_path: PathBuf) -> anyhow::Result<Self> {
        let mut config = AgentConfig {
            file_path: file_path.clone(),
            ..Default::default()
        };

        if file_path.exists() {
            let content = std::fs::read_to_string(&file_path)?;
            if let Ok(file) = serde_json::from_str::<ConfigFile>(&content) {
                config.apply(file);
            } else {
                tracing::warn!(
                    path = %file_path.display(),
                    "failed to parse agent config, using defaults"
                );
            }
        }

        Ok(config)
    }

    fn apply(&mut self, file: ConfigFile) {
        if !file.storage_root.is_empty() {
            self.storage_root = PathBuf::from(file.storage_root);
        }
        if !file.chunk_folder.is_empty() && !Path::new(&file.chunk_folder).is_absolute() {
            self.chunk_folder = file.chunk_folder;
        }
        if !file.output_dir.is_empty() {
            self.output_dir = Some(PathBuf::from(file.output_dir));
        }
        if (1..=100).contains(&file.max_merge_attempts) {
            self.max_merge_attempts = file.max_merge_attempts;
        }
        if file.initial_backoff_ms > 0 {
            self.initial_backoff_ms = file.initial_backoff_ms;
        }
        if file.max_backoff_ms > 0 {
            self.max_backoff_ms = file.max_backoff_ms;
        }
        self.require_complete = file.require_complete;
        self.merge_dispatch = file.merge_dispatch;
        if file.default_buffer_size > 0 && file.default_buffer_size as usize <= MAX_BUFFER_SIZE {
            self.default_buffer_size = file.default_buffer_size;
        }
    }

    /// Saves configuration to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = ConfigFile {
            storage_root: self.storage_root.display().to_string(),
            chunk_folder: self.chunk_folder.clone(),
            output_dir: self
                .output_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            max_merge_attempts: self.max_merge_attempts,
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            require_complete: self.require_complete,
            merge_dispatch: self.merge_dispatch,
            default_buffer_size: self.default_buffer_size,
        };

        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.file_path, &json)?;

        tracing::debug!(path = %self.file_path.display(), "agent configuration saved");
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Directory where chunks are stored.
    pub fn chunk_dir(&self) -> PathBuf {
        self.storage_root.join(&self.chunk_folder)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_merge_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    /// Builds the coordinator configuration.
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            chunk_dir: self.chunk_dir(),
            output_dir: self.output_dir.clone(),
            merge: MergeOptions {
                retry: self.retry_policy(),
                require_complete: self.require_complete,
            },
            dispatch: self.merge_dispatch,
        }
    }
}

pub fn config_file_path() -> anyhow::Result<PathBuf> {
    let config_dir = config_base_dir()?;
    Ok(config_dir.join("chunkmerge").join("config.json"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home).join(".config"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp"))
    }
}
