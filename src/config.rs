// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Missing file or missing fields fall back to defaults.

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
            title: "Vulkan Frame Core".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred present mode. FIFO is used when the surface lacks it.
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub depth_attachment: bool,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub hot_reload_shaders: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            depth_attachment: true,
            vertex_shader: PathBuf::from("shaders/triangle.vert.spv"),
            fragment_shader: PathBuf::from("shaders/triangle.frag.spv"),
            hot_reload_shaders: false,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Only honoured in debug builds.
    pub validation_layers: bool,
    pub log_filter: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_filter: "info".to_string(),
            show_fps: true,
        }
    }
}

/// The part of the configuration the renderer core consumes.
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub app_name: String,
    pub enable_validation: bool,
    pub preferred_present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
    pub depth_attachment: bool,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub hot_reload_shaders: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Config::default().renderer_settings()
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

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> vk::PresentModeKHR {
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

    /// Log filter level; unknown names fall back to `info`.
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_filter
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }

    pub fn renderer_settings(&self) -> RendererSettings {
        RendererSettings {
            app_name: self.window.title.clone(),
            enable_validation: cfg!(debug_assertions) && self.debug.validation_layers,
            preferred_present_mode: self.get_present_mode(),
            clear_color: self.graphics.clear_color,
            depth_attachment: self.graphics.depth_attachment,
            vertex_shader: self.graphics.vertex_shader.clone(),
            fragment_shader: self.graphics.fragment_shader.clone(),
            hot_reload_shaders: self.graphics.hot_reload_shaders,
        }
    }
}
