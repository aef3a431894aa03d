// Renderer - ties the backend pieces into a textured-model renderer
//
// Static resources (mesh, texture, sampler, descriptor layout, shaders) are
// created once. Everything that depends on the swapchain (pipeline, per-image
// uniform buffers and descriptor sets, pre-recorded command buffers) is
// rebuilt with it. FrameSynchronizer drives each frame through FrameBackend.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::buffer::GpuBuffer;
use crate::backend::command::CommandPool;
use crate::backend::image::{GpuImage, Sampler};
use crate::backend::pipeline::{DescriptorSetLayout, GraphicsPipeline, VertexLayout};
use crate::backend::shader::ShaderModule;
use crate::backend::sync::FrameSync;
use crate::backend::{
    Acquire, BackendResult, FrameBackend, FrameStatus, FrameSynchronizer, Present,
    SurfaceTarget, SwapchainManager, UploadEngine, VulkanDevice,
};
use crate::mesh::{Mesh, TextureData, Vertex};

/// Degrees per second the model turns about Z
const ROTATION_SPEED: f32 = 90.0;

pub struct RendererSettings {
    pub app_name: String,
    pub validation: bool,
    pub present_mode: vk::PresentModeKHR,
    pub max_frames_in_flight: usize,
    pub clear_color: [f32; 4],
}

/// Everything the scene is built from, already read from disk
pub struct SceneAssets {
    pub mesh: Mesh,
    pub texture: TextureData,
    pub vertex_spv: Vec<u8>,
    pub fragment_spv: Vec<u8>,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// Model spinning about Z, seen from (2, 2, 2)
    pub fn at(elapsed_secs: f32, extent: vk::Extent2D) -> Self {
        let aspect = extent.width as f32 / extent.height.max(1) as f32;

        let model = Mat4::from_rotation_z(elapsed_secs * ROTATION_SPEED.to_radians());
        let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

pub struct Renderer {
    frames: FrameSynchronizer,
    state: RenderState,
}

impl Renderer {
    pub fn new(
        target: SurfaceTarget,
        window: vk::Extent2D,
        settings: &RendererSettings,
        assets: SceneAssets,
    ) -> Result<Self> {
        let device = VulkanDevice::new(&settings.app_name, settings.validation, Some(target))
            .context("Failed to create Vulkan device")?;

        let state = RenderState::new(device, window, settings, assets)?;
        let frames = FrameSynchronizer::new(state.slots.len(), state.swapchain.image_count());

        Ok(Self { frames, state })
    }

    /// Render and present one frame
    pub fn draw_frame(&mut self) -> BackendResult<FrameStatus> {
        self.frames.draw_frame(&mut self.state)
    }

    /// Rebuild everything tied to the swapchain.
    ///
    /// Returns `false` without touching anything while the window has no area.
    pub fn recreate_swapchain(&mut self, window: vk::Extent2D) -> Result<bool> {
        if window.width == 0 || window.height == 0 {
            log::debug!("Window has no area, deferring swapchain recreation");
            return Ok(false);
        }

        self.state.rebuild(window)?;
        self.frames.reset_images(self.state.swapchain.image_count());
        Ok(true)
    }

    pub fn wait_idle(&self) -> BackendResult<()> {
        self.state.device.wait_idle()
    }
}

/// Per swapchain image: a uniform buffer and the descriptor set pointing at it
struct PerImage {
    uniform_buffers: Vec<GpuBuffer>,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    device: Arc<VulkanDevice>,
}

impl PerImage {
    fn new(
        device: Arc<VulkanDevice>,
        image_count: usize,
        layout: vk::DescriptorSetLayout,
        texture_view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> BackendResult<Self> {
        let ubo_size = std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize;
        let uniform_buffers = (0..image_count)
            .map(|_| {
                GpuBuffer::new(
                    device.clone(),
                    ubo_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let count = image_count as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: count,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(count);
        let descriptor_pool = unsafe { device.device.create_descriptor_pool(&pool_info, None)? };

        // From here on Drop releases the pool
        let mut per_image = Self {
            uniform_buffers,
            descriptor_pool,
            descriptor_sets: Vec::new(),
            device,
        };

        let layouts = vec![layout; image_count];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&layouts);
        per_image.descriptor_sets =
            unsafe { per_image.device.device.allocate_descriptor_sets(&alloc_info)? };

        for (&set, buffer) in per_image.descriptor_sets.iter().zip(&per_image.uniform_buffers) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: buffer.buffer,
                offset: 0,
                range: ubo_size,
            }];
            let image_info = [vk::DescriptorImageInfo {
                sampler,
                image_view: texture_view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];

            let writes = [
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info),
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info),
            ];

            unsafe { per_image.device.device.update_descriptor_sets(&writes, &[]) };
        }

        Ok(per_image)
    }
}

impl Drop for PerImage {
    fn drop(&mut self) {
        // Also frees the sets
        unsafe {
            self.device
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None)
        };
    }
}

struct RenderState {
    // Declaration order is destruction order
    slots: Vec<FrameSync>,
    command_buffers: Vec<vk::CommandBuffer>,
    per_image: PerImage,
    pipeline: GraphicsPipeline,
    swapchain: SwapchainManager,
    descriptor_layout: DescriptorSetLayout,
    vertex_shader: ShaderModule,
    fragment_shader: ShaderModule,
    sampler: Sampler,
    texture: GpuImage,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    index_count: u32,
    commands: CommandPool,

    clear_color: [f32; 4],
    start: Instant,
    device: Arc<VulkanDevice>,
}

impl RenderState {
    fn new(
        device: Arc<VulkanDevice>,
        window: vk::Extent2D,
        settings: &RendererSettings,
        assets: SceneAssets,
    ) -> Result<Self> {
        let swapchain = SwapchainManager::create(device.clone(), window, settings.present_mode)
            .context("Failed to create swapchain")?;

        let commands = CommandPool::new(device.clone())?;

        // Static resources; the engine and its staging buffers go away afterwards
        let (vertex_buffer, index_buffer, texture) = {
            let upload = UploadEngine::new(device.clone())?;

            let vertex_buffer = upload
                .upload_buffer(
                    bytemuck::cast_slice(&assets.mesh.vertices),
                    vk::BufferUsageFlags::VERTEX_BUFFER,
                )
                .context("Failed to upload vertices")?;
            let index_buffer = upload
                .upload_buffer(
                    bytemuck::cast_slice(&assets.mesh.indices),
                    vk::BufferUsageFlags::INDEX_BUFFER,
                )
                .context("Failed to upload indices")?;

            if cfg!(debug_assertions) {
                let read_back = upload.download_buffer(&vertex_buffer)?;
                if read_back.as_slice() != bytemuck::cast_slice::<Vertex, u8>(&assets.mesh.vertices) {
                    anyhow::bail!("Vertex buffer contents differ from the uploaded mesh");
                }
                log::debug!("Vertex upload verified ({} bytes)", read_back.len());
            }

            let texture = &assets.texture;
            let image = upload
                .upload_texture(
                    &texture.pixels,
                    texture.width,
                    texture.height,
                    texture.mip_levels(),
                )
                .context("Failed to upload texture")?;

            (vertex_buffer, index_buffer, image)
        };

        let sampler = Sampler::new(device.clone(), texture.desc.mip_levels)?;
        let descriptor_layout = DescriptorSetLayout::new(device.clone())?;

        let vertex_shader = ShaderModule::from_spv(device.clone(), &assets.vertex_spv)
            .context("Failed to create vertex shader")?;
        let fragment_shader = ShaderModule::from_spv(device.clone(), &assets.fragment_spv)
            .context("Failed to create fragment shader")?;

        let pipeline = create_pipeline(
            &device,
            &swapchain,
            &descriptor_layout,
            &vertex_shader,
            &fragment_shader,
        )?;

        let per_image = PerImage::new(
            device.clone(),
            swapchain.image_count(),
            descriptor_layout.handle,
            texture.view,
            sampler.sampler,
        )?;

        let slots = FrameSync::create_slots(&device, settings.max_frames_in_flight)?;

        let mut state = Self {
            slots,
            command_buffers: Vec::new(),
            per_image,
            pipeline,
            swapchain,
            descriptor_layout,
            vertex_shader,
            fragment_shader,
            sampler,
            texture,
            vertex_buffer,
            index_buffer,
            index_count: assets.mesh.indices.len() as u32,
            commands,
            clear_color: settings.clear_color,
            start: Instant::now(),
            device,
        };
        state.record_command_buffers()?;

        log::info!(
            "Renderer ready: {} indices, {} frames in flight",
            state.index_count,
            state.slots.len()
        );
        Ok(state)
    }

    fn rebuild(&mut self, window: vk::Extent2D) -> Result<()> {
        self.device.wait_idle()?;

        self.commands.free(&self.command_buffers);
        self.command_buffers.clear();

        self.swapchain
            .recreate(window)
            .context("Failed to recreate swapchain")?;

        self.pipeline = create_pipeline(
            &self.device,
            &self.swapchain,
            &self.descriptor_layout,
            &self.vertex_shader,
            &self.fragment_shader,
        )?;

        self.per_image = PerImage::new(
            self.device.clone(),
            self.swapchain.image_count(),
            self.descriptor_layout.handle,
            self.texture.view,
            self.sampler.sampler,
        )?;

        self.record_command_buffers()?;
        Ok(())
    }

    /// One command buffer per swapchain image, recorded once and resubmitted
    fn record_command_buffers(&mut self) -> BackendResult<()> {
        let count = self.swapchain.image_count() as u32;
        self.command_buffers = self.commands.allocate(count)?;

        let d = &self.device.device;
        let extent = self.swapchain.extent();
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            let render_pass_info = vk::RenderPassBeginInfo::default()
                .render_pass(self.swapchain.render_pass())
                .framebuffer(self.swapchain.framebuffers()[i])
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear_values);

            unsafe {
                d.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())?;
                d.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

                d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
                d.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
                d.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
                d.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline.layout,
                    0,
                    &[self.per_image.descriptor_sets[i]],
                    &[],
                );
                d.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);

                d.cmd_end_render_pass(cmd);
                d.end_command_buffer(cmd)?;
            }
        }

        log::debug!("Recorded {} command buffers", count);
        Ok(())
    }
}

impl Drop for RenderState {
    fn drop(&mut self) {
        log::info!("Cleaning up renderer resources...");
        // Nothing may still be executing when the fields below are destroyed
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Failed to wait for the GPU during cleanup: {}", e);
        }
    }
}

fn create_pipeline(
    device: &Arc<VulkanDevice>,
    swapchain: &SwapchainManager,
    descriptor_layout: &DescriptorSetLayout,
    vertex_shader: &ShaderModule,
    fragment_shader: &ShaderModule,
) -> BackendResult<GraphicsPipeline> {
    let bindings = Vertex::binding_descriptions();
    let attributes = Vertex::attribute_descriptions();

    GraphicsPipeline::new(
        device.clone(),
        swapchain.render_pass(),
        swapchain.extent(),
        descriptor_layout.handle,
        vertex_shader,
        fragment_shader,
        VertexLayout {
            bindings: &bindings,
            attributes: &attributes,
        },
    )
}

impl FrameBackend for RenderState {
    fn wait_for_slot(&mut self, slot: usize) -> BackendResult<()> {
        self.slots[slot].wait()
    }

    fn acquire(&mut self, slot: usize) -> BackendResult<Acquire> {
        self.swapchain.acquire(self.slots[slot].image_available)
    }

    fn reset_slot(&mut self, slot: usize) -> BackendResult<()> {
        self.slots[slot].reset()
    }

    fn update_frame_data(&mut self, image_index: u32) -> BackendResult<()> {
        let ubo = UniformBufferObject::at(self.start.elapsed().as_secs_f32(), self.swapchain.extent());
        self.per_image.uniform_buffers[image_index as usize].write(bytemuck::bytes_of(&ubo))
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> BackendResult<()> {
        let sync = &self.slots[slot];

        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffers[image_index as usize]];
        let signal_semaphores = [sync.render_finished];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                sync.in_flight_fence,
            )?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> BackendResult<Present> {
        self.swapchain.present(
            self.device.present_queue,
            image_index,
            self.slots[slot].render_finished,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 3 * 64);
    }

    #[test]
    fn model_turns_ninety_degrees_per_second() {
        let ubo = UniformBufferObject::at(1.0, extent(800, 600));
        let x = ubo.model * Vec4::new(1.0, 0.0, 0.0, 1.0);
        assert!(x.x.abs() < 1e-5);
        assert!((x.y - 1.0).abs() < 1e-5);

        let still = UniformBufferObject::at(0.0, extent(800, 600));
        assert_eq!(still.model, Mat4::IDENTITY);
    }

    #[test]
    fn origin_projects_to_screen_centre() {
        let ubo = UniformBufferObject::at(0.0, extent(1280, 720));
        let clip = ubo.proj * ubo.view * ubo.model * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip / clip.w;

        assert!(ndc.x.abs() < 1e-5);
        assert!(ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn projection_flips_y() {
        let ubo = UniformBufferObject::at(0.0, extent(800, 600));
        assert!(ubo.proj.y_axis.y < 0.0);
    }

    #[test]
    fn zero_height_does_not_divide_by_zero() {
        let ubo = UniformBufferObject::at(0.0, extent(800, 0));
        assert!(ubo.proj.x_axis.x.is_finite());
    }
}
