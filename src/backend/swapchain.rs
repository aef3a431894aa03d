// Swapchain - Window presentation
//
// Owns everything whose size or format follows the surface: the swapchain and
// its image views, the render pass, the multisampled colour and depth targets
// and one framebuffer per swapchain image. All of it is rebuilt together.

use ash::vk;
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::image::{create_image_view, find_depth_format, GpuImage};
use super::pipeline::RenderPass;
use super::VulkanDevice;

/// What the surface supports for this device
#[derive(Clone, Debug, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(device: &VulkanDevice) -> BackendResult<Self> {
        let surface = device.surface()?;
        let loader = &device.surface_loader;
        let physical = device.physical_device;

        unsafe {
            Ok(Self {
                capabilities: loader.get_physical_device_surface_capabilities(physical, surface)?,
                formats: loader.get_physical_device_surface_formats(physical, surface)?,
                present_modes: loader.get_physical_device_surface_present_modes(physical, surface)?,
            })
        }
    }
}

/// Prefer B8G8R8A8_SRGB with sRGB non-linear colour space, else the first format
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> BackendResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or(BackendError::NoSurfaceFormat)
}

/// `preferred` when offered, else MAILBOX, else FIFO (always supported)
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    [preferred, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's current extent, or the window size clamped to what it allows
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 means no maximum)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

impl SwapchainConfig {
    pub fn select(
        support: &SwapchainSupport,
        window: vk::Extent2D,
        preferred_mode: vk::PresentModeKHR,
    ) -> BackendResult<Self> {
        Ok(Self {
            surface_format: choose_surface_format(&support.formats)?,
            present_mode: choose_present_mode(&support.present_modes, preferred_mode),
            extent: choose_extent(&support.capabilities, window),
            image_count: choose_image_count(&support.capabilities),
        })
    }
}

/// Result of acquiring the next image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of queueing an image for presentation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Present {
    Ok,
    Suboptimal,
    OutOfDate,
}

/// Swapchain handle plus one colour view per image
struct SwapchainImages {
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    device: Arc<VulkanDevice>,
}

impl SwapchainImages {
    fn new(
        device: Arc<VulkanDevice>,
        loader: ash::khr::swapchain::Device,
        config: &SwapchainConfig,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        old_swapchain: vk::SwapchainKHR,
    ) -> BackendResult<Self> {
        let families = [device.queue_families.graphics, device.queue_families.present];

        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(device.surface()?)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        create_info = if device.queue_families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        };

        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };

        let mut chain = Self {
            loader,
            swapchain,
            images: Vec::new(),
            views: Vec::new(),
            device,
        };

        // From here on Drop releases whatever has been created
        chain.images = unsafe { chain.loader.get_swapchain_images(swapchain)? };
        for &image in &chain.images {
            let view = create_image_view(
                &chain.device,
                image,
                config.surface_format.format,
                vk::ImageAspectFlags::COLOR,
                1,
            )?;
            chain.views.push(view);
        }

        Ok(chain)
    }
}

impl Drop for SwapchainImages {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// One framebuffer per swapchain image
struct Framebuffers {
    handles: Vec<vk::Framebuffer>,
    device: Arc<VulkanDevice>,
}

impl Framebuffers {
    fn new(
        device: Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        color_target: vk::ImageView,
        depth_target: vk::ImageView,
        swapchain_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> BackendResult<Self> {
        let mut framebuffers = Self {
            handles: Vec::with_capacity(swapchain_views.len()),
            device,
        };

        for &view in swapchain_views {
            // Attachment order matches the render pass: MSAA colour, depth, resolve
            let attachments = [color_target, depth_target, view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let handle = unsafe {
                framebuffers
                    .device
                    .device
                    .create_framebuffer(&framebuffer_info, None)?
            };
            framebuffers.handles.push(handle);
        }

        Ok(framebuffers)
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.handles {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

pub struct SwapchainManager {
    pub config: SwapchainConfig,
    preferred_mode: vk::PresentModeKHR,

    // Declaration order is destruction order
    framebuffers: Framebuffers,
    _color_target: GpuImage,
    _depth_target: GpuImage,
    render_pass: RenderPass,
    chain: SwapchainImages,

    device: Arc<VulkanDevice>,
}

impl SwapchainManager {
    pub fn create(
        device: Arc<VulkanDevice>,
        window: vk::Extent2D,
        preferred_mode: vk::PresentModeKHR,
    ) -> BackendResult<Self> {
        Self::build(device, window, preferred_mode, vk::SwapchainKHR::null())
    }

    fn build(
        device: Arc<VulkanDevice>,
        window: vk::Extent2D,
        preferred_mode: vk::PresentModeKHR,
        old_swapchain: vk::SwapchainKHR,
    ) -> BackendResult<Self> {
        let stage = BackendError::swapchain;

        let support = SwapchainSupport::query(&device).map_err(stage("surface query"))?;
        let config = SwapchainConfig::select(&support, window, preferred_mode)
            .map_err(stage("configuration"))?;

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}, {} images",
            config.extent.width,
            config.extent.height,
            config.surface_format.format,
            config.present_mode,
            config.image_count
        );

        let loader = ash::khr::swapchain::Device::new(&device.instance, &device.device);
        let chain = SwapchainImages::new(
            device.clone(),
            loader,
            &config,
            &support.capabilities,
            old_swapchain,
        )
        .map_err(stage("swapchain"))?;

        let depth_format = find_depth_format(&device).map_err(stage("depth format"))?;

        let render_pass = RenderPass::new(
            device.clone(),
            config.surface_format.format,
            depth_format,
            device.msaa_samples,
        )
        .map_err(stage("render pass"))?;

        let color_target =
            GpuImage::color_target(device.clone(), config.extent, config.surface_format.format)
                .map_err(stage("colour target"))?;
        let depth_target = GpuImage::depth_target(device.clone(), config.extent, depth_format)
            .map_err(stage("depth target"))?;

        let framebuffers = Framebuffers::new(
            device.clone(),
            render_pass.handle,
            color_target.view,
            depth_target.view,
            &chain.views,
            config.extent,
        )
        .map_err(stage("framebuffers"))?;

        log::info!("Swapchain ready with {} images", chain.images.len());

        Ok(Self {
            config,
            preferred_mode,
            framebuffers,
            _color_target: color_target,
            _depth_target: depth_target,
            render_pass,
            chain,
            device,
        })
    }

    /// Rebuild everything for a new window size
    ///
    /// The current swapchain is handed over as `old_swapchain` and destroyed
    /// once the replacement exists. A failure here is fatal to the caller.
    pub fn recreate(&mut self, window: vk::Extent2D) -> BackendResult<()> {
        self.device.wait_idle()?;
        let rebuilt = Self::build(
            self.device.clone(),
            window,
            self.preferred_mode,
            self.chain.swapchain,
        )?;
        *self = rebuilt;
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.chain.images.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers.handles
    }

    /// Acquire the next image, signaling `semaphore` when it is ready
    pub fn acquire(&self, semaphore: vk::Semaphore) -> BackendResult<Acquire> {
        let result = unsafe {
            self.chain.loader.acquire_next_image(
                self.chain.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> BackendResult<Present> {
        let swapchains = [self.chain.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.chain.loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(Present::Ok),
            Ok(true) => Ok(Present::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn caps(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2160,
            },
            ..Default::default()
        }
    }

    #[test]
    fn srgb_format_is_preferred() {
        let formats = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap(), formats[1]);
    }

    #[test]
    fn first_format_is_the_fallback() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap(), formats[0]);

        assert!(matches!(
            choose_surface_format(&[]),
            Err(BackendError::NoSurfaceFormat)
        ));
    }

    #[test]
    fn present_mode_fallback_chain() {
        use vk::PresentModeKHR as M;

        let all = [M::FIFO, M::MAILBOX, M::IMMEDIATE];
        assert_eq!(choose_present_mode(&all, M::IMMEDIATE), M::IMMEDIATE);
        assert_eq!(choose_present_mode(&[M::FIFO, M::MAILBOX], M::IMMEDIATE), M::MAILBOX);
        assert_eq!(choose_present_mode(&[M::FIFO], M::IMMEDIATE), M::FIFO);
        assert_eq!(choose_present_mode(&[M::FIFO, M::IMMEDIATE], M::FIFO), M::FIFO);
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let fixed = caps(2, 3, (1280, 720));
        let window = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert_eq!(choose_extent(&fixed, window), fixed.current_extent);
    }

    #[test]
    fn extent_clamps_window_when_surface_is_flexible() {
        let flexible = caps(2, 3, (u32::MAX, u32::MAX));

        let big = vk::Extent2D {
            width: 10_000,
            height: 10_000,
        };
        assert_eq!(
            choose_extent(&flexible, big),
            vk::Extent2D {
                width: 4096,
                height: 2160
            }
        );

        let zero = vk::Extent2D {
            width: 0,
            height: 0,
        };
        assert_eq!(
            choose_extent(&flexible, zero),
            vk::Extent2D {
                width: 1,
                height: 1
            }
        );
    }

    #[test]
    fn image_count_is_min_plus_one_within_bounds() {
        assert_eq!(choose_image_count(&caps(2, 8, (1, 1))), 3);
        assert_eq!(choose_image_count(&caps(3, 3, (1, 1))), 3);
        // Unbounded maximum
        assert_eq!(choose_image_count(&caps(2, 0, (1, 1))), 3);
    }

    #[test]
    fn selection_is_idempotent() {
        let support = SwapchainSupport {
            capabilities: caps(2, 0, (u32::MAX, u32::MAX)),
            formats: vec![
                format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };
        let window = vk::Extent2D {
            width: 1024,
            height: 768,
        };

        let first = SwapchainConfig::select(&support, window, vk::PresentModeKHR::MAILBOX).unwrap();
        let second =
            SwapchainConfig::select(&support, window, vk::PresentModeKHR::MAILBOX).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.extent, window);
        assert_eq!(first.image_count, 3);
        assert_eq!(first.surface_format.format, vk::Format::B8G8R8A8_SRGB);
    }
}
