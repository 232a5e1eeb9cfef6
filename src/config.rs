// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default; a missing or broken file falls back to them.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub sync: SyncConfig,
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
            title: "Frame Pacer".to_string(),
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
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Back-pressure depth: how far the CPU may run ahead of the GPU.
    pub frames_in_flight: usize,
    /// Shader-visible texture descriptor slots.
    pub srv_heap_capacity: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.45, 0.55, 0.60, 1.0],
            frames_in_flight: 2,
            srv_heap_capacity: 64,
        }
    }
}

/// CPU/GPU wait behaviour
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Absent means fence waits never time out.
    pub fence_wait_timeout_ms: Option<u64>,
    /// How often the loop wakes up while the window is occluded.
    pub occluded_poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fence_wait_timeout_ms: None,
            occluded_poll_interval_ms: 10,
        }
    }
}

impl SyncConfig {
    pub fn fence_wait_timeout(&self) -> Option<Duration> {
        self.fence_wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn occluded_poll_interval(&self) -> Duration {
        Duration::from_millis(self.occluded_poll_interval_ms)
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "frame_pacer.log".to_string(),
            show_fps: true,
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

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.graphics.frames_in_flight == 0 {
            anyhow::bail!("graphics.frames_in_flight must be at least 1");
        }
        if self.graphics.srv_heap_capacity == 0 {
            anyhow::bail!("graphics.srv_heap_capacity must be at least 1");
        }
        if self.sync.fence_wait_timeout_ms == Some(0) {
            anyhow::bail!("sync.fence_wait_timeout_ms must be positive when set");
        }
        Ok(())
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.graphics.srv_heap_capacity, 64);
        assert_eq!(config.sync.fence_wait_timeout(), None);
        assert_eq!(config.sync.occluded_poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            frames_in_flight = 3

            [sync]
            fence_wait_timeout_ms = 2000
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.graphics.srv_heap_capacity, 64);
        assert_eq!(config.sync.fence_wait_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(Config::from_toml("[graphics]\nframes_in_flight = 0").is_err());
        assert!(Config::from_toml("[graphics]\nsrv_heap_capacity = 0").is_err());
        assert!(Config::from_toml("[sync]\nfence_wait_timeout_ms = 0").is_err());
    }

    #[test]
    fn present_mode_parsing() {
        let mut config = Config::default();
        config.graphics.present_mode = "Mailbox".to_string();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::MAILBOX);

        config.graphics.present_mode = "bogus".to_string();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
    }
}
