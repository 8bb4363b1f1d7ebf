use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::ModelShape;
use crate::compositor::FeatherMode;
use crate::drift_guard::DriftGuardConfig;
use crate::error::EngineError;
use crate::post_filter::PostFilterConfig;
use crate::region::RegionWeighterConfig;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "UPTILE_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub scaling: ScalingConfig,
    pub tiling: TilingConfig,
    pub drift_guard: DriftGuardConfig,
    pub region: RegionWeighterConfig,
    pub post_filter: PostFilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingConfig {
    /// Output pixels per input pixel the user asked for, independent of
    /// the model's native factor.
    pub user_scale_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TilingConfig {
    /// Overlap between adjacent tiles, in input pixels.
    pub overlap: usize,
    pub feather_mode: FeatherMode,
    /// Feather ramp width in output pixels. 0 derives it from the overlap
    /// and scale factor.
    pub feather_margin: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scaling: ScalingConfig::default(),
            tiling: TilingConfig::default(),
            drift_guard: DriftGuardConfig::default(),
            region: RegionWeighterConfig::default(),
            post_filter: PostFilterConfig::default(),
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            user_scale_factor: 2.0,
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            overlap: 16,
            feather_mode: FeatherMode::Cosine,
            feather_margin: 0,
        }
    }
}

impl TilingConfig {
    /// Feather margin in output pixels for the given scale factor.
    pub fn effective_feather_margin(&self, user_scale: f64) -> usize {
        if self.feather_margin > 0 {
            self.feather_margin
        } else {
            ((self.overlap as f64 * user_scale) as usize).max(1)
        }
    }
}

impl EngineConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Checks the config against the model geometry it will drive.
    pub fn validate(&self, shape: &ModelShape) -> Result<(), EngineError> {
        let scale = self.scaling.user_scale_factor;
        if !(scale.is_finite() && scale > 0.0) {
            return Err(EngineError::invalid_configuration(format!(
                "user_scale_factor {scale} must be a positive finite number"
            )));
        }
        if shape.tile_width == 0 || shape.tile_height == 0 || shape.native_scale == 0 {
            return Err(EngineError::invalid_configuration(format!(
                "model shape {}x{} scale {} is degenerate",
                shape.tile_width, shape.tile_height, shape.native_scale
            )));
        }
        if self.tiling.overlap >= shape.tile_width || self.tiling.overlap >= shape.tile_height {
            return Err(EngineError::invalid_configuration(format!(
                "overlap {} leaves no effective tile advance for {}x{} tiles",
                self.tiling.overlap, shape.tile_width, shape.tile_height
            )));
        }
        self.post_filter.validate()?;
        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. UPTILE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        let default_cfg = EngineConfig::default();
        default_cfg.save_to_path(&cfg_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_shape() -> ModelShape {
        ModelShape {
            channels: 3,
            tile_width: 512,
            tile_height: 512,
            native_scale: 4,
        }
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();

        assert_eq!(cfg.scaling.user_scale_factor, 2.0);
        assert_eq!(cfg.tiling.overlap, 16);
        assert_eq!(cfg.tiling.feather_mode, FeatherMode::Cosine);
        assert_eq!(cfg.tiling.feather_margin, 0);
        assert!(cfg.drift_guard.enabled);
        assert_eq!(cfg.drift_guard.weight_floor, 0.55);
        assert!(cfg.region.enabled);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = EngineConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: EngineConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let loaded = EngineConfig::load_from_path(&dir.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, EngineConfig::default());
    }

    #[test]
    fn partial_toml_fills_remaining_fields_from_defaults() {
        let raw = "[scaling]\nuser_scale_factor = 3.0\n";
        let cfg: EngineConfig = toml::from_str(raw).expect("parse partial config");

        assert_eq!(cfg.scaling.user_scale_factor, 3.0);
        assert_eq!(cfg.tiling.overlap, 16);
        assert!(cfg.drift_guard.enabled);
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli_path = Path::new("/custom");
        let result = data_dir(Some(cli_path));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempdir().expect("tempdir");
        let data_dir = temp.path().join("data");
        initialize_data_dir(&data_dir).expect("initialize data dir");

        assert!(data_dir.exists());
        assert!(data_dir.join("config.toml").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempdir().expect("tempdir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[scaling]\nuser_scale_factor = 3.0\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn validate_accepts_defaults() {
        let cfg = EngineConfig::default();
        cfg.validate(&test_shape()).expect("defaults must validate");
    }

    #[test]
    fn validate_rejects_overlap_consuming_whole_tile() {
        let mut cfg = EngineConfig::default();
        cfg.tiling.overlap = 512;
        assert!(matches!(
            cfg.validate(&test_shape()),
            Err(EngineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn validate_rejects_non_positive_scale() {
        let mut cfg = EngineConfig::default();
        cfg.scaling.user_scale_factor = 0.0;
        assert!(matches!(
            cfg.validate(&test_shape()),
            Err(EngineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn feather_margin_defaults_to_scaled_overlap() {
        let tiling = TilingConfig::default();
        assert_eq!(tiling.effective_feather_margin(2.0), 32);

        let explicit = TilingConfig {
            feather_margin: 12,
            ..Default::default()
        };
        assert_eq!(explicit.effective_feather_margin(2.0), 12);
    }
}
