//! What the remote client can decode and display.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::image::PixelFormat;

/// Client capabilities negotiated for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCapabilities {
    /// Encodings the client can paint, in preference order.
    pub encodings: Vec<String>,
    /// Per-encoding colourspaces the client decoder accepts.
    /// A missing entry means "any".
    pub csc_modes: BTreeMap<String, Vec<PixelFormat>>,
    /// Largest area the client will render, if limited.
    pub render_size: Option<(u32, u32)>,
    /// Client understands `scroll` packets.
    pub scrolling: bool,
    /// Bandwidth limit in bits per second (0 = unlimited).
    pub bandwidth_limit: u64,
    /// Client scales video streams up itself.
    pub video_scaling: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            encodings: vec!["rgb".into()],
            csc_modes: BTreeMap::new(),
            render_size: None,
            scrolling: true,
            bandwidth_limit: 0,
            video_scaling: true,
        }
    }
}

impl ClientCapabilities {
    pub fn accepts_encoding(&self, encoding: &str) -> bool {
        self.encodings.iter().any(|e| e == encoding)
    }

    /// Whether the client can decode `encoding` output in `format`.
    pub fn accepts_csc(&self, encoding: &str, format: PixelFormat) -> bool {
        match self.csc_modes.get(encoding) {
            Some(modes) => modes.contains(&format),
            None => true,
        }
    }
}
