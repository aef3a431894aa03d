// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every object keeps the device alive through
// an Arc and destroys its own handles on drop.

pub mod barrier;
pub mod buffer;
pub mod command;
pub mod device;
pub mod error;
pub mod frame;
pub mod image;
pub mod mipmap;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use device::{SurfaceTarget, VulkanDevice};
pub use error::BackendResult;
pub use frame::{FrameBackend, FrameStatus, FrameSynchronizer};
pub use swapchain::{Acquire, Present, SwapchainManager};
pub use upload::UploadEngine;
