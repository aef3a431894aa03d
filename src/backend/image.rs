// Device-local images: textures and attachment targets
//
// Like buffers, each image owns one allocation plus the view created for it.

use ash::vk;
use std::sync::Arc;

use super::buffer::allocate_memory;
use super::error::{BackendError, BackendResult};
use super::VulkanDevice;

/// Depth formats we can render with, in order of preference
const DEPTH_FORMATS: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// An image, its backing memory and a view over all its mip levels
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub desc: ImageDesc,
    device: Arc<VulkanDevice>,
}

impl GpuImage {
    pub fn new(device: Arc<VulkanDevice>, desc: ImageDesc) -> BackendResult<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None)? };
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let memory = match allocate_memory(&device, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe { device.device.bind_image_memory(image, memory, 0) }
            .map_err(BackendError::from)
            .and_then(|()| create_image_view(&device, image, desc.format, desc.aspect, desc.mip_levels));

        match view {
            Ok(view) => Ok(Self {
                image,
                memory,
                view,
                desc,
                device,
            }),
            Err(e) => {
                unsafe {
                    device.device.destroy_image(image, None);
                    device.device.free_memory(memory, None);
                }
                Err(e)
            }
        }
    }

    /// Multisampled colour target resolved into the swapchain image
    pub fn color_target(
        device: Arc<VulkanDevice>,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> BackendResult<Self> {
        let samples = device.msaa_samples;
        Self::new(
            device,
            ImageDesc {
                extent,
                format,
                mip_levels: 1,
                samples,
                usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )
    }

    /// Multisampled depth target
    pub fn depth_target(
        device: Arc<VulkanDevice>,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> BackendResult<Self> {
        let samples = device.msaa_samples;
        Self::new(
            device,
            ImageDesc {
                extent,
                format,
                mip_levels: 1,
                samples,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: vk::ImageAspectFlags::DEPTH,
            },
        )
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// 2D view over `mip_levels` levels of a single-layer image
pub fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> BackendResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = unsafe { device.device.create_image_view(&create_info, None)? };
    Ok(view)
}

/// Best depth format usable as an optimal-tiling attachment
pub fn find_depth_format(device: &VulkanDevice) -> BackendResult<vk::Format> {
    device
        .find_supported_format(
            &DEPTH_FORMATS,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
        .ok_or(BackendError::UnsupportedDepthFormat)
}

/// Linear, repeating, anisotropic sampler covering `mip_levels` levels
pub struct Sampler {
    pub sampler: vk::Sampler,
    device: Arc<VulkanDevice>,
}

impl Sampler {
    pub fn new(device: Arc<VulkanDevice>, mip_levels: u32) -> BackendResult<Self> {
        let max_anisotropy = device.properties.limits.max_sampler_anisotropy.min(16.0);

        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(max_anisotropy)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(mip_levels as f32);

        let sampler = unsafe { device.device.create_sampler(&create_info, None)? };
        Ok(Self { sampler, device })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_sampler(self.sampler, None) };
    }
}
