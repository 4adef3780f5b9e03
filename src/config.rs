//! Layered settings for the backup subsystem.
//!
//! Values are resolved in order: built-in defaults, an optional TOML file,
//! then `CITADEL_`-prefixed environment variables (`__` separates sections,
//! e.g. `CITADEL_BACKUP__RETENTION_DAYS=7`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::archive_engine::ArchiveEngineType;
use crate::error::{BackupError, Result};

/// Config file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/citadel/backup.toml";

/// Name of the metadata document inside `backup_root`.
pub const METADATA_FILENAME: &str = "backup_metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub models: ModelSettings,
    #[serde(default)]
    pub rollout: RolloutSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Holds the metadata document
    pub backup_root: PathBuf,
    /// Parent of every backup directory
    pub backup_models: PathBuf,
    /// Live model directories
    pub models_active: PathBuf,
    /// Scratch space for test-mode subsets
    pub models_staging: PathBuf,
    pub app_logs: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/mnt/citadel-backup"),
            backup_models: PathBuf::from("/mnt/citadel-backup/models"),
            models_active: PathBuf::from("/mnt/citadel-models/active"),
            models_staging: PathBuf::from("/mnt/citadel-models/staging"),
            app_logs: PathBuf::from("/opt/citadel/logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    pub engine: ArchiveEngineType,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub compress_backups: bool,
    pub verification_sample_rate: f64,
    pub retention_days: u32,
    /// Executables that must resolve on PATH before the enhanced manager starts
    pub required_tools: Vec<String>,
    pub poll_interval_ms: u64,
    pub completion_timeout_seconds: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            engine: ArchiveEngineType::Rsync,
            max_retry_attempts: 3,
            retry_delay_seconds: 30,
            compress_backups: true,
            verification_sample_rate: 0.1,
            retention_days: 30,
            required_tools: ["rsync", "zstd", "tar", "sha256sum"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            poll_interval_ms: 10_000,
            completion_timeout_seconds: 1800,
        }
    }
}

impl BackupSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Model key -> directory name under `models_active`
    pub model_directories: BTreeMap<String, String>,
    /// Short name -> model key
    pub convenience_links: BTreeMap<String, String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let model_directories = [
            ("mixtral-8x7b-instruct", "Mixtral-8x7B-Instruct-v0.1"),
            ("yi-34b-chat", "Yi-34B-Chat"),
            ("nous-hermes-2-mixtral", "Nous-Hermes-2-Mixtral-8x7B-DPO"),
            ("openchat-3.5", "openchat-3.5-1210"),
            ("phi-3-mini-128k", "Phi-3-mini-128k-instruct"),
            ("deepcoder-14b-instruct", "deepseek-coder-14b-instruct-v1.5"),
            ("mimo-vl-7b-rl", "imp-v1_5-7b"),
        ];
        let convenience_links = [
            ("mixtral", "mixtral-8x7b-instruct"),
            ("yi34b", "yi-34b-chat"),
            ("hermes", "nous-hermes-2-mixtral"),
            ("openchat", "openchat-3.5"),
            ("phi3", "phi-3-mini-128k"),
            ("coder", "deepcoder-14b-instruct"),
            ("vision", "mimo-vl-7b-rl"),
        ];

        Self {
            model_directories: to_map(&model_directories),
            convenience_links: to_map(&convenience_links),
        }
    }
}

impl ModelSettings {
    /// Resolve a short name or model key to its directory name.
    pub fn directory_for(&self, model_name: &str) -> Option<&str> {
        let key = self
            .convenience_links
            .get(model_name)
            .map(String::as_str)
            .unwrap_or(model_name);
        self.model_directories.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutSettings {
    pub models: Vec<String>,
    pub pause_seconds: u64,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            models: ["phi3", "openchat", "mixtral", "hermes", "yi34b", "coder", "vision"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            pause_seconds: 5,
        }
    }
}

fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Settings {
    /// Build the provider chain without extracting it, so callers can merge
    /// CLI overrides on top.
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        match config_file {
            Some(path) => figment = figment.merge(Toml::file_exact(path)),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    figment = figment.merge(Toml::file_exact(default_path));
                }
            }
        }

        figment.merge(Env::prefixed("CITADEL_").split("__"))
    }

    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(config_file))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let backup = &self.backup;

        if backup.max_retry_attempts < 1 {
            return Err(BackupError::Config(
                "backup.max_retry_attempts must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&backup.verification_sample_rate) {
            return Err(BackupError::Config(format!(
                "backup.verification_sample_rate must be within 0.0-1.0, got {}",
                backup.verification_sample_rate
            )));
        }

        if backup.poll_interval_ms == 0 {
            return Err(BackupError::Config(
                "backup.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.paths.backup_root.join(METADATA_FILENAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.paths.app_logs.join("backup_manager.log")
    }

    /// Settings rooted under a scratch directory, with no tool requirements
    /// and fast polling. Used by tests and dry runs.
    pub fn rooted_at(root: &Path) -> Self {
        let mut settings = Settings::default();
        settings.paths = PathSettings {
            backup_root: root.join("backup"),
            backup_models: root.join("backup/models"),
            models_active: root.join("models/active"),
            models_staging: root.join("models/staging"),
            app_logs: root.join("logs"),
        };
        settings.backup.engine = ArchiveEngineType::NativeCopy;
        settings.backup.required_tools = Vec::new();
        settings.backup.retry_delay_seconds = 0;
        settings.backup.poll_interval_ms = 10;
        settings.backup.completion_timeout_seconds = 30;
        settings.rollout.pause_seconds = 0;
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.backup.max_retry_attempts, 3);
        assert_eq!(settings.backup.retention_days, 30);
        assert_eq!(
            settings.metadata_path(),
            PathBuf::from("/mnt/citadel-backup/backup_metadata.json")
        );
    }

    #[test]
    fn test_directory_for_resolves_short_names_and_keys() {
        let models = ModelSettings::default();
        assert_eq!(models.directory_for("phi3"), Some("Phi-3-mini-128k-instruct"));
        assert_eq!(
            models.directory_for("phi-3-mini-128k"),
            Some("Phi-3-mini-128k-instruct")
        );
        assert_eq!(models.directory_for("llama-70b"), None);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut settings = Settings::default();
        settings.backup.max_retry_attempts = 0;
        assert!(matches!(settings.validate(), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_sample_rate_out_of_range() {
        let mut settings = Settings::default();
        settings.backup.verification_sample_rate = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("backup.toml");
        std::fs::write(
            &path,
            r#"
[paths]
backup_root = "/srv/backup"

[backup]
retention_days = 7
engine = "native-copy"
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.paths.backup_root, PathBuf::from("/srv/backup"));
        assert_eq!(settings.backup.retention_days, 7);
        assert_eq!(settings.backup.engine, ArchiveEngineType::NativeCopy);
        // Untouched keys keep their defaults
        assert_eq!(settings.backup.max_retry_attempts, 3);
    }

    #[test]
    fn test_missing_explicit_config_file_is_an_error() {
        let temp = tempdir().unwrap();
        let result = Settings::load(Some(&temp.path().join("absent.toml")));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }
}
