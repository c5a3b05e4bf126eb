//! Configuration for the pixwire server.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use pixwire_core::{ClientCapabilities, PipelinePolicy};

use crate::pattern::{CaptureConfig, PatternMode};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Synthetic capture settings.
    pub capture: CaptureSection,
    /// What connecting clients are assumed to support.
    pub client: ClientSection,
    /// Encode pipeline tunables.
    pub pipeline: PipelinePolicy,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind.
    pub listen_address: String,
    /// TCP port for client connections.
    pub listen_port: u16,
    /// Maximum concurrent client connections.
    pub max_connections: u32,
}

/// Test-pattern window settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub width: u32,
    pub height: u32,
    /// Damage events per second.
    pub fps: u8,
    /// "scroll" or "band".
    pub mode: String,
    /// Pattern movement in pixels per second.
    pub speed: u32,
}

/// Client capability defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Encodings in preference order.
    pub encodings: Vec<String>,
    pub scrolling: bool,
    /// Bits per second, 0 = unlimited.
    pub bandwidth_limit: u64,
    /// `[width, height]`; empty = unlimited.
    pub render_size: Vec<u32>,
    pub video_scaling: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".into(),
            listen_port: 10000,
            max_connections: 4,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 25,
            mode: "scroll".into(),
            speed: 120,
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            encodings: vec!["rgb".into()],
            scrolling: true,
            bandwidth_limit: 0,
            render_size: Vec::new(),
            video_scaling: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Capture settings for the test-pattern window.
    pub fn to_capture_config(&self) -> CaptureConfig {
        let mode = match self.capture.mode.to_ascii_lowercase().as_str() {
            "band" => PatternMode::Band,
            "scroll" => PatternMode::Scroll,
            other => {
                tracing::warn!(mode = other, "unknown capture mode; using scroll");
                PatternMode::Scroll
            }
        };
        CaptureConfig {
            width: self.capture.width.clamp(16, 8192),
            height: self.capture.height.clamp(16, 8192),
            fps: self.capture.fps.clamp(1, 60),
            mode,
            speed: self.capture.speed.min(10_000),
        }
    }

    /// Capabilities assumed for every client.
    pub fn to_client_capabilities(&self) -> ClientCapabilities {
        let mut encodings: Vec<String> = Vec::new();
        for e in &self.client.encodings {
            let e = e.trim().to_ascii_lowercase();
            if !e.is_empty() && !encodings.contains(&e) {
                encodings.push(e);
            }
        }
        if encodings.is_empty() {
            encodings.push("rgb".into());
        }
        let render_size = match self.client.render_size.as_slice() {
            [w, h] if *w > 0 && *h > 0 => Some((*w, *h)),
            _ => None,
        };
        ClientCapabilities {
            encodings,
            csc_modes: BTreeMap::new(),
            render_size,
            scrolling: self.client.scrolling,
            bandwidth_limit: self.client.bandwidth_limit,
            video_scaling: self.client.video_scaling,
        }
    }

    /// The pipeline policy with out-of-range values clamped.
    pub fn to_pipeline_policy(&self) -> PipelinePolicy {
        self.pipeline.clone().normalized()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = ServerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("listen_port"));
        assert!(text.contains("[pipeline.compression]"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = ServerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.listen_port, 10000);
        assert_eq!(parsed.capture.fps, 25);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: ServerConfig = toml::from_str("[capture]\nmode = \"band\"\n").unwrap();
        assert_eq!(parsed.capture.mode, "band");
        assert_eq!(parsed.capture.width, 1280);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn to_capture_config_clamps() {
        let mut cfg = ServerConfig::default();
        cfg.capture.fps = 200;
        cfg.capture.width = 1;
        cfg.capture.mode = "sideways".into();
        let cap = cfg.to_capture_config();
        assert_eq!(cap.fps, 60);
        assert_eq!(cap.width, 16);
        assert_eq!(cap.mode, PatternMode::Scroll);
    }

    #[test]
    fn client_capabilities_are_normalised() {
        let mut cfg = ServerConfig::default();
        cfg.client.encodings = vec!["H264".into(), " rgb".into(), "h264".into(), "".into()];
        cfg.client.render_size = vec![1920, 1080];
        let caps = cfg.to_client_capabilities();
        assert_eq!(caps.encodings, vec!["h264".to_string(), "rgb".to_string()]);
        assert_eq!(caps.render_size, Some((1920, 1080)));

        cfg.client.encodings.clear();
        cfg.client.render_size = vec![0, 5];
        let caps = cfg.to_client_capabilities();
        assert_eq!(caps.encodings, vec!["rgb".to_string()]);
        assert_eq!(caps.render_size, None);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(Path::new("/nonexistent/pixwire-server.toml"));
        assert_eq!(cfg.network.max_connections, 4);
    }
}
