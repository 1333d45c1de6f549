// Error types for the frame core
//
// Fatal conditions only. A stale surface is not an error: acquisition and
// presentation report it through `frame::Acquire` / `frame::Present`.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    /// The Vulkan loader could not be found or opened.
    #[error("Failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    /// A driver call failed; `what` names the call site.
    #[error("{what} failed: {result}")]
    Call {
        what: &'static str,
        result: vk::Result,
    },

    #[error("Requested validation layers are not available: {0:?}")]
    MissingValidationLayers(Vec<String>),

    #[error("Unsupported window system: {0}")]
    UnsupportedWindow(String),

    #[error("No suitable GPU found")]
    NoSuitableDevice,

    #[error("Surface reports no formats")]
    NoSurfaceFormats,

    #[error("Surface reports no present modes")]
    NoPresentModes,

    #[error("No supported depth format")]
    NoDepthFormat,

    #[error("No memory type with properties {0:?}")]
    NoMemoryType(vk::MemoryPropertyFlags),

    #[error("Failed to read shader {path:?}: {source}")]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Shader watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Attach call-site context to raw driver results.
pub trait VkResultExt<T> {
    fn during(self, what: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn during(self, what: &'static str) -> Result<T> {
        self.map_err(|result| RenderError::Call { what, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn during_keeps_the_call_site_and_code() {
        let failed: std::result::Result<(), vk::Result> =
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        match failed.during("Create depth image") {
            Err(RenderError::Call { what, result }) => {
                assert_eq!(what, "Create depth image");
                assert_eq!(result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn during_passes_success_through() {
        let ok: std::result::Result<u32, vk::Result> = Ok(7);
        assert_eq!(ok.during("anything").unwrap(), 7);
    }
}
