use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tunables of graph compilation. Missing keys take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MapConfig {
    /// Depth of every circular buffer, in tiles
    pub cb_depth_tiles: usize,
    /// Upper bound on the cores one kernel is spread over
    pub cores_per_kernel: usize,
    /// Share generated programs between identical kernels
    pub program_cache: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self { cb_depth_tiles: 2, cores_per_kernel: 1, program_cache: true }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io { path: PathBuf, #[source] source: std::io::Error },

    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("`{key}` must be at least 1")]
    Zero { key: &'static str },
}

impl MapConfig {
    pub fn from_yaml_str(src: &str) -> Result<Self, ConfigError> {
        let config: MapConfig = serde_yaml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&src)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cb_depth_tiles == 0 {
            return Err(ConfigError::Zero { key: "cb_depth_tiles" });
        }
        if self.cores_per_kernel == 0 {
            return Err(ConfigError::Zero { key: "cores_per_kernel" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config = MapConfig::from_yaml_str("cores_per_kernel: 4\n").unwrap();
        assert_eq!(config, MapConfig { cores_per_kernel: 4, ..MapConfig::default() });
        assert_eq!(MapConfig::from_yaml_str("{}").unwrap().cb_depth_tiles, 2);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(MapConfig::from_yaml_str("cb_depth_tiles: 0"), Err(ConfigError::Zero { .. })));
        assert!(matches!(MapConfig::from_yaml_str("cb_depth: 3"), Err(ConfigError::Yaml(_))));
        assert!(matches!(MapConfig::from_yaml_file("/nonexistent/map.yaml"), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn yaml_roundtrip_of_defaults() {
        let text = serde_yaml::to_string(&MapConfig::default()).unwrap();
        assert_eq!(MapConfig::from_yaml_str(&text).unwrap(), MapConfig::default());
    }
}
