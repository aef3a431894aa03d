// Backend error taxonomy
//
// Everything here is fatal. Swapchain staleness is not an error: acquire and
// present report it as a value (see swapchain::Acquire / swapchain::Present).

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    /// The Vulkan loader could not be found or opened
    #[error("failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("validation layer {0} requested but not available")]
    ValidationLayersUnavailable(String),

    #[error("no GPU satisfies the renderer's requirements")]
    NoSuitableDevice,

    #[error("no memory type in mask {type_bits:#b} provides {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("format {0:?} does not support linear blitting")]
    UnsupportedBlitFormat(vk::Format),

    #[error("unsupported layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("no supported depth attachment format")]
    UnsupportedDepthFormat,

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error("device was created without a presentation surface")]
    Headless,

    /// A step of swapchain construction failed; nothing built so far is usable
    #[error("swapchain creation failed while creating {stage}: {source}")]
    SwapchainCreation {
        stage: &'static str,
        #[source]
        source: Box<BackendError>,
    },

    #[error("refusing to upload an empty buffer")]
    EmptyUpload,

    #[error("texture needs {expected} bytes of RGBA8 pixels, got {actual}")]
    TextureSizeMismatch { expected: u64, actual: u64 },

    #[error("buffer was not created with TRANSFER_SRC usage")]
    NotTransferSource,

    #[error("invalid SPIR-V: {0}")]
    InvalidShader(#[from] std::io::Error),
}

impl BackendError {
    /// Wraps an error from a swapchain construction step
    pub fn swapchain(stage: &'static str) -> impl FnOnce(BackendError) -> BackendError {
        move |source| BackendError::SwapchainCreation {
            stage,
            source: Box::new(source),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_wrapper_keeps_stage_and_cause() {
        let err = BackendError::swapchain("framebuffers")(BackendError::Vulkan(
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        ));
        let text = err.to_string();
        assert!(text.contains("framebuffers"));
        let cause = std::error::Error::source(&err).expect("cause is kept");
        assert!(cause.to_string().starts_with("Vulkan error"));
    }

    #[test]
    fn vk_results_convert() {
        let err: BackendError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, BackendError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
    }
}
