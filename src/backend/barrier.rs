// Image layout transitions
//
// Only the transitions the upload and mip paths need are supported; anything
// else is a programming error reported as UnsupportedLayoutTransition.

use ash::vk;
use std::ops::Range;

use super::error::{BackendError, BackendResult};

/// Access and stage masks for one layout transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> BackendResult<TransitionMasks> {
    use vk::ImageLayout as L;

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::TRANSFER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_READ,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        _ => return Err(BackendError::UnsupportedLayoutTransition { old, new }),
    };

    Ok(masks)
}

/// A colour-aspect layout transition over a range of mip levels
#[derive(Clone, Debug)]
pub struct LayoutTransition {
    pub image: vk::Image,
    pub levels: Range<u32>,
    pub old: vk::ImageLayout,
    pub new: vk::ImageLayout,
    masks: TransitionMasks,
}

impl LayoutTransition {
    pub fn new(
        image: vk::Image,
        levels: Range<u32>,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> BackendResult<Self> {
        Ok(Self {
            image,
            levels,
            old,
            new,
            masks: transition_masks(old, new)?,
        })
    }

    pub fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(self.masks.src_access)
            .dst_access_mask(self.masks.dst_access)
            .old_layout(self.old)
            .new_layout(self.new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: self.levels.start,
                level_count: self.levels.len() as u32,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                self.masks.src_stage,
                self.masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transition_waits_on_nothing() {
        let masks = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert!(masks.src_access.is_empty());
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn shader_read_transitions_target_fragment_stage() {
        for old in [
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ] {
            let masks = transition_masks(old, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL).unwrap();
            assert_eq!(masks.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
            assert_eq!(masks.dst_access, vk::AccessFlags::SHADER_READ);
        }
    }

    #[test]
    fn unknown_transitions_are_rejected() {
        let err = transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedLayoutTransition { .. }));
    }
}
