//! Vulkan frame rendering core: device setup, a resizable image chain, and a
//! frames-in-flight render loop.

pub mod backend;
pub mod config;
pub mod error;

pub use backend::{DeviceContext, FrameBackend, ImageChain};
pub use config::{Config, RendererSettings};
pub use error::{RenderError, Result};
