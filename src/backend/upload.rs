// Upload engine
//
// Moves CPU data into device-local buffers and images through a transient
// staging buffer. Every call blocks until the GPU copy has finished, so it is
// meant for init-time resources only.

use ash::vk;
use std::sync::Arc;

use super::barrier::LayoutTransition;
use super::buffer::GpuBuffer;
use super::command::CommandPool;
use super::error::{BackendError, BackendResult};
use super::image::{GpuImage, ImageDesc};
use super::mipmap::generate_mips;
use super::VulkanDevice;

/// Colour format used for every uploaded texture
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub struct UploadEngine {
    device: Arc<VulkanDevice>,
    commands: CommandPool,
}

impl UploadEngine {
    pub fn new(device: Arc<VulkanDevice>) -> BackendResult<Self> {
        let commands = CommandPool::new(device.clone())?;
        Ok(Self { device, commands })
    }

    /// Upload `data` into a new device-local buffer with `usage`
    pub fn upload_buffer(&self, data: &[u8], usage: vk::BufferUsageFlags) -> BackendResult<GpuBuffer> {
        if data.is_empty() {
            return Err(BackendError::EmptyUpload);
        }
        let size = data.len() as vk::DeviceSize;

        let staging = GpuBuffer::staging(self.device.clone(), size)?;
        staging.write(data)?;

        let mut usage = usage | vk::BufferUsageFlags::TRANSFER_DST;
        if cfg!(debug_assertions) {
            // Lets download_buffer read anything back
            usage |= vk::BufferUsageFlags::TRANSFER_SRC;
        }

        let buffer = GpuBuffer::new(
            self.device.clone(),
            size,
            usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        self.copy_buffer(&staging, &buffer, size)?;

        log::debug!("Uploaded {} bytes ({:?})", size, usage);
        Ok(buffer)
    }

    /// Upload tightly packed RGBA8 pixels and build `mip_levels` levels
    pub fn upload_texture(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> BackendResult<GpuImage> {
        check_texture_size(pixels.len(), width, height)?;

        let staging = GpuBuffer::staging(self.device.clone(), pixels.len() as vk::DeviceSize)?;
        staging.write(pixels)?;

        let image = GpuImage::new(
            self.device.clone(),
            ImageDesc {
                extent: vk::Extent2D { width, height },
                format: TEXTURE_FORMAT,
                mip_levels,
                samples: vk::SampleCountFlags::TYPE_1,
                // TRANSFER_SRC: every level is a blit source for the next
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )?;

        let to_transfer = LayoutTransition::new(
            image.image,
            0..mip_levels,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });

        self.commands.one_shot(|d, cmd| {
            to_transfer.record(d, cmd);
            unsafe {
                d.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        })?;
        drop(staging);

        generate_mips(
            &self.device,
            &self.commands,
            image.image,
            TEXTURE_FORMAT,
            width,
            height,
            mip_levels,
        )?;

        log::info!("Texture uploaded: {}x{}, {} mip levels", width, height, mip_levels);
        Ok(image)
    }

    /// Read a device-local buffer back to the host
    pub fn download_buffer(&self, buffer: &GpuBuffer) -> BackendResult<Vec<u8>> {
        if !buffer.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
            return Err(BackendError::NotTransferSource);
        }

        let staging = GpuBuffer::staging(self.device.clone(), buffer.size)?;
        self.copy_buffer(buffer, &staging, buffer.size)?;
        staging.read()
    }

    fn copy_buffer(&self, src: &GpuBuffer, dst: &GpuBuffer, size: vk::DeviceSize) -> BackendResult<()> {
        let region = vk::BufferCopy::default().size(size);
        self.commands.one_shot(|d, cmd| unsafe {
            d.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]);
        })
    }
}

/// Pixels must cover exactly `width * height` RGBA8 texels
pub fn check_texture_size(len: usize, width: u32, height: u32) -> BackendResult<()> {
    if len == 0 || width == 0 || height == 0 {
        return Err(BackendError::EmptyUpload);
    }

    let expected = (u64::from(width) * u64::from(height)).saturating_mul(4);
    let actual = len as u64;
    if actual != expected {
        return Err(BackendError::TextureSizeMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mipmap::mip_levels;

    #[test]
    fn texture_size_must_match_extent() {
        assert!(check_texture_size(256 * 256 * 4, 256, 256).is_ok());
        assert!(check_texture_size(3 * 5 * 4, 3, 5).is_ok());

        let err = check_texture_size(16, 256, 256).unwrap_err();
        assert!(matches!(
            err,
            BackendError::TextureSizeMismatch {
                expected: 262_144,
                actual: 16
            }
        ));

        // One texel too many is rejected just like one too few
        assert!(check_texture_size(2 * 2 * 4 + 4, 2, 2).is_err());
    }

    #[test]
    fn zero_sized_textures_are_rejected() {
        assert!(matches!(check_texture_size(0, 4, 4), Err(BackendError::EmptyUpload)));
        assert!(matches!(check_texture_size(64, 0, 4), Err(BackendError::EmptyUpload)));
        assert!(matches!(check_texture_size(64, 4, 0), Err(BackendError::EmptyUpload)));
    }

    #[test]
    fn large_extents_do_not_overflow() {
        let err = check_texture_size(4, u32::MAX, u32::MAX).unwrap_err();
        assert!(matches!(err, BackendError::TextureSizeMismatch { actual: 4, .. }));
    }

    fn headless_engine() -> UploadEngine {
        let device = VulkanDevice::new("upload-test", false, None).expect("Vulkan device");
        UploadEngine::new(device).expect("upload engine")
    }

    #[test]
    #[ignore = "needs a Vulkan driver"]
    fn buffer_round_trip_is_byte_identical() {
        let engine = headless_engine();
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();

        let buffer = engine
            .upload_buffer(&data, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();
        assert_eq!(buffer.size, data.len() as u64);
        assert!(buffer.usage.contains(vk::BufferUsageFlags::TRANSFER_DST));

        let read_back = engine.download_buffer(&buffer).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    #[ignore = "needs a Vulkan driver"]
    fn empty_upload_is_rejected() {
        let engine = headless_engine();
        let err = engine
            .upload_buffer(&[], vk::BufferUsageFlags::INDEX_BUFFER)
            .unwrap_err();
        assert!(matches!(err, BackendError::EmptyUpload));
    }

    #[test]
    #[ignore = "needs a Vulkan driver"]
    fn texture_gets_full_mip_chain() {
        let engine = headless_engine();
        let pixels = vec![0x80u8; 256 * 256 * 4];
        let levels = mip_levels(256, 256);

        let image = engine.upload_texture(&pixels, 256, 256, levels).unwrap();
        assert_eq!(image.desc.mip_levels, 9);
        assert_eq!(image.desc.format, TEXTURE_FORMAT);
    }
}
