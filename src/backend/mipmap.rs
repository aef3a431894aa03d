// Mip chain generation by repeated linear blits
//
// Level 0 must already hold the pixels in TRANSFER_DST_OPTIMAL. Each level is
// read once to produce the next one and then finalized to
// SHADER_READ_ONLY_OPTIMAL; no level is revisited after that.

use ash::vk;

use super::barrier::LayoutTransition;
use super::command::CommandPool;
use super::error::{BackendError, BackendResult};
use super::VulkanDevice;

/// Number of levels for a full chain: floor(log2(max(w, h))) + 1
pub fn mip_levels(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Size of `level`, each dimension halved per level and never below 1
pub fn mip_extent(width: u32, height: u32, level: u32) -> (u32, u32) {
    let shrink = |size: u32| size.checked_shr(level).unwrap_or(0).max(1);
    (shrink(width), shrink(height))
}

/// One recorded operation of the chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MipStep {
    Transition {
        level: u32,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    /// Blit `level` into `level + 1`
    Blit {
        level: u32,
        src_extent: (u32, u32),
        dst_extent: (u32, u32),
    },
}

/// Ordered barriers and blits producing levels 1..levels from level 0
pub fn plan_mip_chain(width: u32, height: u32, levels: u32) -> Vec<MipStep> {
    use vk::ImageLayout as L;

    let levels = levels.max(1);
    let mut steps = Vec::with_capacity(levels as usize * 3);

    for level in 1..levels {
        let src = level - 1;
        steps.push(MipStep::Transition {
            level: src,
            old: L::TRANSFER_DST_OPTIMAL,
            new: L::TRANSFER_SRC_OPTIMAL,
        });
        steps.push(MipStep::Blit {
            level: src,
            src_extent: mip_extent(width, height, src),
            dst_extent: mip_extent(width, height, level),
        });
        steps.push(MipStep::Transition {
            level: src,
            old: L::TRANSFER_SRC_OPTIMAL,
            new: L::SHADER_READ_ONLY_OPTIMAL,
        });
    }

    // The last level was only ever written
    steps.push(MipStep::Transition {
        level: levels - 1,
        old: L::TRANSFER_DST_OPTIMAL,
        new: L::SHADER_READ_ONLY_OPTIMAL,
    });

    steps
}

/// Replay `plan` starting with every level in TRANSFER_DST_OPTIMAL.
///
/// Returns the final layout of each level, or `None` if a step finds a level
/// in a layout other than the one it expects.
pub fn final_layouts(plan: &[MipStep], levels: u32) -> Option<Vec<vk::ImageLayout>> {
    let mut layouts = vec![vk::ImageLayout::TRANSFER_DST_OPTIMAL; levels as usize];

    for step in plan {
        match *step {
            MipStep::Transition { level, old, new } => {
                let slot = layouts.get_mut(level as usize)?;
                if *slot != old {
                    return None;
                }
                *slot = new;
            }
            MipStep::Blit { level, .. } => {
                let src = *layouts.get(level as usize)?;
                let dst = *layouts.get(level as usize + 1)?;
                if src != vk::ImageLayout::TRANSFER_SRC_OPTIMAL
                    || dst != vk::ImageLayout::TRANSFER_DST_OPTIMAL
                {
                    return None;
                }
            }
        }
    }

    Some(layouts)
}

/// Build the full mip chain of `image` on the GPU and wait for it
pub fn generate_mips(
    device: &VulkanDevice,
    commands: &CommandPool,
    image: vk::Image,
    format: vk::Format,
    width: u32,
    height: u32,
    levels: u32,
) -> BackendResult<()> {
    let features = device.format_properties(format).optimal_tiling_features;
    if !features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
        return Err(BackendError::UnsupportedBlitFormat(format));
    }

    // Resolve every barrier up front; recording itself cannot fail
    enum Op {
        Barrier(LayoutTransition),
        Blit(vk::ImageBlit),
    }

    let plan = plan_mip_chain(width, height, levels);
    debug_assert!(final_layouts(&plan, levels.max(1)).is_some());

    let ops = plan
        .into_iter()
        .map(|step| match step {
            MipStep::Transition { level, old, new } => {
                LayoutTransition::new(image, level..level + 1, old, new).map(Op::Barrier)
            }
            MipStep::Blit {
                level,
                src_extent,
                dst_extent,
            } => Ok(Op::Blit(blit_region(level, src_extent, dst_extent))),
        })
        .collect::<BackendResult<Vec<_>>>()?;

    log::debug!("Generating {} mip levels for {}x{} image", levels, width, height);

    commands.one_shot(|d, cmd| {
        for op in &ops {
            match op {
                Op::Barrier(transition) => transition.record(d, cmd),
                Op::Blit(region) => unsafe {
                    d.cmd_blit_image(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        std::slice::from_ref(region),
                        vk::Filter::LINEAR,
                    );
                },
            }
        }
    })
}

fn blit_region(level: u32, src: (u32, u32), dst: (u32, u32)) -> vk::ImageBlit {
    let layers = |mip_level| vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    };
    let corner = |(w, h): (u32, u32)| vk::Offset3D {
        x: w as i32,
        y: h as i32,
        z: 1,
    };

    vk::ImageBlit::default()
        .src_subresource(layers(level))
        .src_offsets([vk::Offset3D::default(), corner(src)])
        .dst_subresource(layers(level + 1))
        .dst_offsets([vk::Offset3D::default(), corner(dst)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_count_matches_log2() {
        assert_eq!(mip_levels(256, 256), 9);
        assert_eq!(mip_levels(1024, 512), 11);
        assert_eq!(mip_levels(300, 17), 9);
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(0, 0), 1);
    }

    #[test]
    fn level_extents_halve_down_to_one() {
        for &(w, h) in &[(256u32, 256u32), (300, 17), (1, 64), (1024, 3)] {
            let levels = mip_levels(w, h);
            for i in 0..levels {
                assert_eq!(mip_extent(w, h, i), ((w >> i).max(1), (h >> i).max(1)));
            }
            assert_eq!(mip_extent(w, h, levels - 1), (1, 1));
        }
        assert_eq!(mip_extent(5, 5, 40), (1, 1));
    }

    #[test]
    fn every_level_ends_shader_readable() {
        let levels = mip_levels(256, 256);
        let plan = plan_mip_chain(256, 256, levels);
        let layouts = final_layouts(&plan, levels).expect("plan respects layout order");

        assert_eq!(layouts.len(), 9);
        assert!(layouts
            .iter()
            .all(|&layout| layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
    }

    #[test]
    fn plan_walks_levels_in_order() {
        let plan = plan_mip_chain(8, 2, 4);
        let blits: Vec<_> = plan
            .iter()
            .filter_map(|step| match *step {
                MipStep::Blit {
                    level,
                    src_extent,
                    dst_extent,
                } => Some((level, src_extent, dst_extent)),
                _ => None,
            })
            .collect();

        assert_eq!(
            blits,
            vec![
                (0, (8, 2), (4, 1)),
                (1, (4, 1), (2, 1)),
                (2, (2, 1), (1, 1)),
            ]
        );
        assert_eq!(plan.len(), 3 * 3 + 1);
    }

    #[test]
    fn single_level_only_finalizes() {
        let plan = plan_mip_chain(1, 1, 1);
        assert_eq!(
            plan,
            vec![MipStep::Transition {
                level: 0,
                old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }]
        );
    }

    #[test]
    fn replay_rejects_out_of_order_blit() {
        let plan = [MipStep::Blit {
            level: 0,
            src_extent: (2, 2),
            dst_extent: (1, 1),
        }];
        assert_eq!(final_layouts(&plan, 2), None);
    }

    #[test]
    fn blit_region_covers_both_levels() {
        let region = blit_region(2, (64, 32), (32, 16));
        assert_eq!(region.src_subresource.mip_level, 2);
        assert_eq!(region.dst_subresource.mip_level, 3);
        assert_eq!(region.src_offsets[1], vk::Offset3D { x: 64, y: 32, z: 1 });
        assert_eq!(region.dst_offsets[1], vk::Offset3D { x: 32, y: 16, z: 1 });
    }
}
