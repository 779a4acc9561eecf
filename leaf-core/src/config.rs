use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafConfig {
    pub viewer: ViewerConfig,
    pub search: SearchConfig,
    pub progress: ProgressConfig,
    pub network: NetworkConfig,
    pub server: ServerConfig,
}

impl LeafConfig {
    /// Reads a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub base_scale: f32,
    pub visible_radius: usize,
    pub priority_radius: usize,
    pub leading_pages: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub prefetch_stagger: Duration,
    pub intersection_threshold: f32,
    pub root_margin: f32,
    pub default_zoom: f32,
    pub min_zoom: f32,
    pub max_zoom: f32,
    pub zoom_step: f32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            base_scale: 1.5,
            visible_radius: 3,
            priority_radius: 5,
            leading_pages: 5,
            settle_delay: Duration::from_millis(2000),
            prefetch_stagger: Duration::from_millis(100),
            intersection_threshold: 0.3,
            root_margin: 200.0,
            default_zoom: 1.6,
            min_zoom: 0.5,
            max_zoom: 3.0,
            zoom_step: 0.2,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub batch_size: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub debounce: Duration,
    pub context_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            debounce: Duration::from_millis(300),
            context_chars: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub size_ceiling_bytes: usize,
    pub keep_previews: usize,
    pub keep_sessions: usize,
    pub preview_max_width: u32,
    pub preview_max_height: u32,
    pub preview_quality: u8,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            size_ceiling_bytes: 4 * 1024 * 1024,
            keep_previews: 10,
            keep_sessions: 5,
            preview_max_width: 300,
            preview_max_height: 400,
            preview_quality: 70,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Base URL of a server exposing `/api/pdf-proxy` and `/api/pdf-upload`.
    pub proxy_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub upload_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
    pub user_agent: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_owned(),
            upload_dir: None,
            max_upload_bytes: 50 * 1024 * 1024,
            user_agent: "Mozilla/5.0 (compatible; PDF-Viewer/1.0)".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = LeafConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.viewer.visible_radius, 3);
        assert_eq!(config.search.batch_size, 10);
        assert_eq!(config.progress.keep_sessions, 5);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[viewer]\nsettle_delay = 500\n\n[search]\ncontext_chars = 20\n",
        )
        .unwrap();

        let config = LeafConfig::load(&path).unwrap();
        assert_eq!(config.viewer.settle_delay, Duration::from_millis(500));
        assert_eq!(config.viewer.prefetch_stagger, Duration::from_millis(100));
        assert_eq!(config.search.context_chars, 20);
        assert_eq!(config.search.debounce, Duration::from_millis(300));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[viewer\n").unwrap();
        assert!(matches!(
            LeafConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
