// Shader module loading
//
// SPIR-V arrives as raw bytes (compiled by build.rs or shipped alongside the
// binary). read_spv takes care of word alignment and the magic number.

use ash::vk;
use std::io::Cursor;
use std::sync::Arc;

use super::error::BackendResult;
use super::VulkanDevice;

pub struct ShaderModule {
    pub module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytes
    pub fn from_spv(device: Arc<VulkanDevice>, bytes: &[u8]) -> BackendResult<Self> {
        let code = decode_spv(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        let module = unsafe { device.device.create_shader_module(&create_info, None)? };
        Ok(Self { module, device })
    }
}

/// Decode little-endian SPIR-V bytes into words
pub fn decode_spv(bytes: &[u8]) -> BackendResult<Vec<u32>> {
    Ok(ash::util::read_spv(&mut Cursor::new(bytes))?)
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::error::BackendError;

    #[test]
    fn spirv_words_are_decoded() {
        // Magic number followed by one word
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x01, 0x00, 0x00, 0x00];
        assert_eq!(decode_spv(&bytes).unwrap(), vec![0x0723_0203, 1]);
    }

    #[test]
    fn truncated_spirv_is_rejected() {
        let err = decode_spv(&[0x03, 0x02, 0x23, 0x07, 0x01]).unwrap_err();
        assert!(matches!(err, BackendError::InvalidShader(_)));
    }
}
