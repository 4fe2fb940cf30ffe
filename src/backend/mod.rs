// Backend module - Vulkan abstraction layer
//
// Thin wrapper around ash with safety and ergonomics.

pub mod buffer;
pub mod command;
pub mod device;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::{DeviceBuffer, ImageResource, MappedSlice};
pub use command::CommandPool;
pub use device::VulkanDevice;
pub use swapchain::{AcquireOutcome, Swapchain};
pub use sync::FrameSync;
