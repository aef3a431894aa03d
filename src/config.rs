// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section has defaults, so a missing file or a partial file both work.
// A file that fails to parse is reported and replaced by the defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Model Renderer".to_string(),
            width: 800,
            height: 600,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Input files; `None` selects the built-in quad and checkerboard
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub model: Option<PathBuf>,
    pub texture: Option<PathBuf>,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            model: None,
            texture: None,
            vertex_shader: PathBuf::from("shaders/shader.vert.spv"),
            fragment_shader: PathBuf::from("shaders/shader.frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;

        if config.graphics.max_frames_in_flight == 0 {
            log::warn!("max_frames_in_flight must be at least 1, using 1");
            config.graphics.max_frames_in_flight = 1;
        }

        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert!(config.assets.model.is_none());
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            title = "chalet"

            [graphics]
            present_mode = "FIFO"

            [assets]
            model = "models/chalet.obj"
            texture = "textures/chalet.jpg"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "chalet");
        assert_eq!(config.window.height, 600);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.assets.model, Some(PathBuf::from("models/chalet.obj")));
        assert_eq!(
            config.assets.vertex_shader,
            PathBuf::from("shaders/shader.vert.spv")
        );
    }

    #[test]
    fn zero_frames_in_flight_is_raised_to_one() {
        let config = Config::parse("[graphics]\nmax_frames_in_flight = 0").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 1);
    }

    #[test]
    fn unknown_present_mode_falls_back() {
        let config = Config::parse("[graphics]\npresent_mode = \"vsync-ish\"").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("no/such/config.toml").unwrap();
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
    }
}
