// Backend module - Vulkan frame rendering core
//
// Ownership: DeviceContext is shared (Arc) by ImageChain and FrameBackend and
// outlives both. FrameBackend owns the ImageChain it renders into.

pub mod device;
pub mod frame;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::{DeviceContext, QueueFamilyIndices};
pub use frame::{Acquire, FrameOps, FrameScheduler, FrameStatus, Present, Recreate, MAX_FRAMES_IN_FLIGHT};
pub use renderer::{BackendState, FrameBackend};
pub use surface::SurfaceSupport;
pub use swapchain::ImageChain;
