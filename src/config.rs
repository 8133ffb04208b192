use std::path::Path;

use crate::error::ConfigError;
use crate::training::capture::CaptureConfig;
use crate::training::trainer::TrainerConfig;

pub use crate::agents::{DataConfig, GameConfig};

/// Optimizer hyperparameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            learning_rate: 1e-3,
        }
    }
}

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub trainer: TrainerConfig,
    pub capture: CaptureConfig,
    pub game: GameConfig,
    pub data: DataConfig,
    pub optimizer: OptimizerConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            eprintln!("Warning: config file '{}' not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trainer.n_epochs == 0 {
            return Err(ConfigError::Validation(
                "trainer.n_epochs must be > 0".into(),
            ));
        }
        if self.capture.n_samples == 0 {
            return Err(ConfigError::Validation(
                "capture.n_samples must be > 0".into(),
            ));
        }
        if self.optimizer.learning_rate <= 0.0 {
            return Err(ConfigError::Validation(
                "optimizer.learning_rate must be > 0".into(),
            ));
        }

        if self.data.n_objects == 0 {
            return Err(ConfigError::Validation(
                "data.n_objects must be > 0".into(),
            ));
        }
        if self.data.batch_size == 0 {
            return Err(ConfigError::Validation(
                "data.batch_size must be > 0".into(),
            ));
        }
        if self.data.batches_per_epoch == 0 {
            return Err(ConfigError::Validation(
                "data.batches_per_epoch must be > 0".into(),
            ));
        }

        if self.game.vocab_size == 0 {
            return Err(ConfigError::Validation(
                "game.vocab_size must be > 0".into(),
            ));
        }
        if self.game.receiver_hidden == 0 {
            return Err(ConfigError::Validation(
                "game.receiver_hidden must be > 0".into(),
            ));
        }
        if self.game.temperature <= 0.0 {
            return Err(ConfigError::Validation(
                "game.temperature must be > 0".into(),
            ));
        }
        if self.game.sender_entropy_coeff < 0.0 {
            return Err(ConfigError::Validation(
                "game.sender_entropy_coeff must be >= 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&AppConfig::default()).expect("default config serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::checkpoint::KeyMap;
    use crate::training::gradients::ArchiveMode;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[capture]
n_samples = 3
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.capture.n_samples, 3);
        // Other fields should be defaults
        assert_eq!(config.capture.archive, ArchiveMode::Buffered);
        assert_eq!(config.trainer.n_epochs, 10);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        let default = AppConfig::default();
        assert!((config.optimizer.learning_rate - default.optimizer.learning_rate).abs() < 1e-12);
        assert_eq!(config.trainer.n_epochs, default.trainer.n_epochs);
        assert_eq!(config.trainer.receiver_key_map, KeyMap::Identity);
    }

    #[test]
    fn test_key_maps_parse() {
        let toml_str = r#"
[trainer]
receiver_key_map = { add_prefix = "agent" }

[capture]
archive = "streaming"
shadow_key_map = { strip_prefix = "agent" }
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.trainer.receiver_key_map, KeyMap::AddPrefix("agent".into()));
        assert_eq!(config.capture.shadow_key_map, KeyMap::StripPrefix("agent".into()));
        assert_eq!(config.capture.archive, ArchiveMode::Streaming);
    }

    #[test]
    fn test_validation_rejects_zero_epochs() {
        let mut config = AppConfig::default();
        config.trainer.n_epochs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_samples() {
        let mut config = AppConfig::default();
        config.capture.n_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_negative_lr() {
        let mut config = AppConfig::default();
        config.optimizer.learning_rate = -0.001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_data() {
        let mut config = AppConfig::default();
        config.data.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.data.batches_per_epoch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_game() {
        let mut config = AppConfig::default();
        config.game.temperature = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.game.sender_entropy_coeff = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default(Path::new("nonexistent_config.toml")).unwrap();
        assert_eq!(config.trainer.n_epochs, 10);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[trainer]
n_epochs = 3
checkpoint_dir = "runs/a"
"#
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.trainer.n_epochs, 3);
        assert_eq!(
            config.trainer.checkpoint_dir.as_deref(),
            Some(Path::new("runs/a"))
        );
        assert!((config.optimizer.learning_rate - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[capture]\nn_samples = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load(&path),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_default_toml_roundtrips() {
        let toml_str = AppConfig::default_toml();
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.validate().expect("roundtripped config should be valid");
    }
}
