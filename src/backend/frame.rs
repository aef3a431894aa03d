// Frame pacing across frames in flight
//
// FrameSynchronizer only decides ordering: which slot to wait on, when to
// reset its fence, when a stale swapchain has to be rebuilt. The Vulkan calls
// themselves go through FrameBackend so the protocol can run without a GPU.

use super::error::BackendResult;
use super::swapchain::{Acquire, Present};

/// Outcome of one frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Acquisition failed as out of date; nothing was submitted
    SwapchainStale,
    /// The frame was presented but the swapchain no longer matches the surface
    NeedsRecreate,
}

/// Device operations a frame is made of
pub trait FrameBackend {
    /// Block until the slot's fence is signaled
    fn wait_for_slot(&mut self, slot: usize) -> BackendResult<()>;

    /// Acquire the next image, signaling the slot's image-available semaphore
    fn acquire(&mut self, slot: usize) -> BackendResult<Acquire>;

    fn reset_slot(&mut self, slot: usize) -> BackendResult<()>;

    /// Refresh per-image data (uniforms) before submission
    fn update_frame_data(&mut self, image_index: u32) -> BackendResult<()>;

    /// Submit the image's commands, signaling render-finished and the slot fence
    fn submit(&mut self, slot: usize, image_index: u32) -> BackendResult<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> BackendResult<Present>;
}

pub struct FrameSynchronizer {
    slot_count: usize,
    current: usize,
    /// Slot whose submission last targeted each swapchain image
    images_in_flight: Vec<Option<usize>>,
}

impl FrameSynchronizer {
    pub fn new(slot_count: usize, image_count: usize) -> Self {
        Self {
            slot_count: slot_count.max(1),
            current: 0,
            images_in_flight: vec![None; image_count],
        }
    }

    #[cfg(test)]
    pub fn current_slot(&self) -> usize {
        self.current
    }

    #[cfg(test)]
    pub fn images_in_flight(&self) -> &[Option<usize>] {
        &self.images_in_flight
    }

    /// Forget every claim; called after the swapchain is rebuilt
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }

    pub fn draw_frame(&mut self, backend: &mut impl FrameBackend) -> BackendResult<FrameStatus> {
        let slot = self.current;
        backend.wait_for_slot(slot)?;

        let (image_index, suboptimal) = match backend.acquire(slot)? {
            Acquire::Image { index, suboptimal } => (index, suboptimal),
            Acquire::OutOfDate => return Ok(FrameStatus::SwapchainStale),
        };

        let image = image_index as usize;
        if image >= self.images_in_flight.len() {
            self.images_in_flight.resize(image + 1, None);
        }

        // Another slot may still be rendering into this image
        if let Some(previous) = self.images_in_flight[image] {
            if previous != slot {
                backend.wait_for_slot(previous)?;
            }
        }
        self.images_in_flight[image] = Some(slot);

        // Reset only once a submission is certain, so an early return above
        // never leaves the fence unsignaled
        backend.reset_slot(slot)?;
        backend.update_frame_data(image_index)?;
        backend.submit(slot, image_index)?;

        let presented = backend.present(slot, image_index)?;

        self.current = (self.current + 1) % self.slot_count;

        Ok(match presented {
            Present::Ok if !suboptimal => FrameStatus::Presented,
            _ => FrameStatus::NeedsRecreate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Pessimistic GPU: a submission only completes when the CPU waits on it
    struct MockBackend {
        signaled: Vec<bool>,
        claimed: Vec<Option<u32>>,
        acquires: VecDeque<Acquire>,
        presents: VecDeque<Present>,
        submissions: Vec<(usize, u32)>,
        updates: Vec<u32>,
    }

    impl MockBackend {
        fn new(slots: usize, acquires: impl IntoIterator<Item = Acquire>) -> Self {
            Self {
                signaled: vec![true; slots],
                claimed: vec![None; slots],
                acquires: acquires.into_iter().collect(),
                presents: VecDeque::new(),
                submissions: Vec::new(),
                updates: Vec::new(),
            }
        }

        fn images(indices: &[u32]) -> Vec<Acquire> {
            indices
                .iter()
                .map(|&index| Acquire::Image {
                    index,
                    suboptimal: false,
                })
                .collect()
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_slot(&mut self, slot: usize) -> BackendResult<()> {
            self.signaled[slot] = true;
            self.claimed[slot] = None;
            Ok(())
        }

        fn acquire(&mut self, _slot: usize) -> BackendResult<Acquire> {
            Ok(self.acquires.pop_front().expect("scripted acquire"))
        }

        fn reset_slot(&mut self, slot: usize) -> BackendResult<()> {
            assert!(self.signaled[slot], "slot {} reset before its fence was observed", slot);
            self.signaled[slot] = false;
            Ok(())
        }

        fn update_frame_data(&mut self, image_index: u32) -> BackendResult<()> {
            self.updates.push(image_index);
            Ok(())
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> BackendResult<()> {
            assert!(!self.signaled[slot], "submitting with a signaled fence");
            for (other, claim) in self.claimed.iter().enumerate() {
                assert!(
                    !(other != slot && !self.signaled[other] && *claim == Some(image_index)),
                    "image {} still in flight on slot {}",
                    image_index,
                    other
                );
            }
            self.claimed[slot] = Some(image_index);
            self.submissions.push((slot, image_index));
            Ok(())
        }

        fn present(&mut self, _slot: usize, _image_index: u32) -> BackendResult<Present> {
            Ok(self.presents.pop_front().unwrap_or(Present::Ok))
        }
    }

    #[test]
    fn slots_advance_round_robin() {
        let mut frames = FrameSynchronizer::new(2, 3);
        let mut backend = MockBackend::new(2, MockBackend::images(&[0, 1, 2, 0, 1, 2]));

        for _ in 0..6 {
            assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        }

        let slots: Vec<usize> = backend.submissions.iter().map(|&(slot, _)| slot).collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(backend.updates, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(frames.current_slot(), 0);
    }

    #[test]
    fn image_claimed_by_other_slot_is_waited_on() {
        // Three slots over two images: the image comes back while its previous
        // slot has not been waited on yet
        let mut frames = FrameSynchronizer::new(3, 2);
        let mut backend = MockBackend::new(3, MockBackend::images(&[0, 1, 0, 1, 0, 1, 0]));

        for _ in 0..7 {
            frames.draw_frame(&mut backend).unwrap();
        }

        assert_eq!(backend.submissions.len(), 7);
        assert_eq!(frames.images_in_flight()[0], Some(0));
    }

    #[test]
    fn out_of_order_images_keep_fences_consistent() {
        let mut frames = FrameSynchronizer::new(2, 4);
        let mut backend =
            MockBackend::new(2, MockBackend::images(&[3, 3, 1, 3, 0, 0, 2, 1, 3, 3]));

        for _ in 0..10 {
            frames.draw_frame(&mut backend).unwrap();
        }
        assert_eq!(backend.submissions.len(), 10);
    }

    #[test]
    fn stale_acquire_submits_nothing() {
        let mut frames = FrameSynchronizer::new(2, 3);
        let mut backend = MockBackend::new(2, [Acquire::OutOfDate]);

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameStatus::SwapchainStale);
        assert!(backend.submissions.is_empty());
        // The fence was never reset, so the next wait cannot deadlock
        assert!(backend.signaled[0]);
        assert_eq!(frames.current_slot(), 0);
    }

    #[test]
    fn suboptimal_results_request_recreation() {
        let mut frames = FrameSynchronizer::new(2, 3);

        let mut backend = MockBackend::new(
            2,
            [Acquire::Image {
                index: 1,
                suboptimal: true,
            }],
        );
        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameStatus::NeedsRecreate);
        assert_eq!(backend.submissions, vec![(0, 1)]);

        for outcome in [Present::Suboptimal, Present::OutOfDate] {
            let mut backend = MockBackend::new(2, MockBackend::images(&[2]));
            backend.presents.push_back(outcome);
            assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameStatus::NeedsRecreate);
        }
    }

    #[test]
    fn reset_images_clears_claims() {
        let mut frames = FrameSynchronizer::new(2, 2);
        let mut backend = MockBackend::new(2, MockBackend::images(&[0, 1]));
        frames.draw_frame(&mut backend).unwrap();
        frames.draw_frame(&mut backend).unwrap();
        assert_eq!(frames.images_in_flight(), &[Some(0), Some(1)]);

        frames.reset_images(4);
        assert_eq!(frames.images_in_flight(), &[None; 4]);
    }
}
