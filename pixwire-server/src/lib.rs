//! # pixwire-server
//!
//! TCP display server built on `pixwire-core`. Every connected client
//! gets its own `Session` streaming a synthetic test-pattern window.
//!
//! ## Modules
//!
//! - **config**: TOML `ServerConfig` and its conversions into core types.
//! - **pattern**: the `TestPattern` frame source (scrolling text or a moving band).
//! - **service**: `PixwireService`, the accept loop and per-client plumbing.

pub mod config;
pub mod pattern;
pub mod service;
