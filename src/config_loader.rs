use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ultraviolet::Vec3;

use crate::backend::{BackendKind, BackendOptions};
use crate::camera::CameraSettings;
use crate::error::ConfigError;
use crate::render::Viewport;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    pub backend_options: BackendOptions,
    pub descriptor_heap_capacity: u32,
    pub viewport: Viewport,
    pub camera: CameraConfig,
    /// Compiled ray tracing library. Required by the hardware backend.
    pub shader_library: Option<PathBuf>,
    pub frames: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Fallback,
            backend_options: BackendOptions::default(),
            descriptor_heap_capacity: 1024,
            viewport: Viewport::new(160, 120),
            camera: CameraConfig::default(),
            shader_library: None,
            frames: 1,
        }
    }
}

impl Config {
    pub fn from_str(value: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(value)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    pub focal_point: Vec3,
    pub look_at: Vec3,
    pub up: Vec3,
    pub settings: CameraSettings,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            focal_point: Vec3::new(0.0, 0.0, 2.0),
            look_at: Vec3::zero(),
            up: Vec3::unit_y(),
            settings: CameraSettings::default(),
        }
    }
}

pub struct ConfigFileLoader {
    pub path: PathBuf,
    config: Option<Config>,
}

impl ConfigFileLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().into(),
            config: None,
        }
    }

    /// Reads the config file, writing the defaults there first if it does not exist.
    pub fn load_config(&mut self) -> Result<&mut Config, ConfigError> {
        let config = match std::fs::read_to_string(&self.path) {
            Ok(content) => Config::from_str(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {:?}, writing the defaults", self.path);
                let config = Config::default();
                self.config = Some(config.clone());
                self.save_config()?;
                config
            }
            Err(err) => return Err(err.into()),
        };
        Ok(self.config.insert(config))
    }

    pub fn get_or_load_config(&mut self) -> Result<&mut Config, ConfigError> {
        if self.config.is_none() {
            self.load_config()?;
        }
        Ok(self.config.get_or_insert_with(Config::default))
    }

    pub fn save_config(&self) -> Result<(), ConfigError> {
        if let Some(config) = &self.config {
            let content = serde_json::to_string_pretty(config)?;
            std::fs::write(&self.path, content)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut loader = ConfigFileLoader::new(&path);
        let config = loader.load_config().unwrap().clone();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let mut reloaded = ConfigFileLoader::new(&path);
        assert_eq!(*reloaded.load_config().unwrap(), config);
    }

    #[test]
    fn partial_configs_fill_in_defaults() {
        let config = Config::from_str(
            r#"{ "backend": "Fallback", "viewport": { "width": 4, "height": 2 },
                 "backend_options": { "fallback": { "latency": 3 } } }"#,
        )
        .unwrap();
        assert_eq!(config.viewport, Viewport::new(4, 2));
        assert_eq!(config.backend_options.fallback.latency, 3);
        assert_eq!(config.descriptor_heap_capacity, 1024);
    }

    #[test]
    fn malformed_configs_are_errors() {
        assert!(matches!(
            Config::from_str("{ \"frames\": \"many\" }"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn edits_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut loader = ConfigFileLoader::new(&path);
        loader.get_or_load_config().unwrap().frames = 7;
        loader.save_config().unwrap();

        let mut reloaded = ConfigFileLoader::new(&path);
        assert_eq!(reloaded.get_or_load_config().unwrap().frames, 7);
    }
}
