// Per-frame recording context
//
// One per in-flight slot, created at startup and reused forever in a ring.

use super::CommandAllocator;
use crate::error::FrameResult;

/// Where a slot is in its life cycle.
///
/// `Idle -> Recording -> Submitted -> (fence wait) -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
}

pub struct FrameContext<A> {
    allocator: A,
    /// Timeline value that proves this slot's last submission finished.
    fence_value: u64,
    state: FrameState,
    slot: usize,
}

impl<A: CommandAllocator> FrameContext<A> {
    pub(crate) fn new(slot: usize, allocator: A) -> Self {
        Self {
            allocator,
            fence_value: 0,
            state: FrameState::Idle,
            slot,
        }
    }

    /// Reset the allocator and start recording.
    ///
    /// Only valid right after the synchronizer handed this slot out, which
    /// is what guarantees the GPU is done with the previous recording.
    pub fn begin_recording(&mut self) -> FrameResult<&mut A> {
        assert_eq!(
            self.state,
            FrameState::Idle,
            "frame slot {} must be idle before recording",
            self.slot
        );
        self.allocator.reset()?;
        self.state = FrameState::Recording;
        Ok(&mut self.allocator)
    }

    /// Drop a recording that will never be submitted.
    pub fn abandon_recording(&mut self) {
        if self.state == FrameState::Recording {
            log::debug!("Frame slot {} abandoned its recording", self.slot);
            self.state = FrameState::Idle;
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn mark_submitted(&mut self, fence_value: u64) {
        assert_eq!(
            self.state,
            FrameState::Recording,
            "frame slot {} submitted without recording",
            self.slot
        );
        debug_assert!(fence_value > self.fence_value);
        self.fence_value = fence_value;
        self.state = FrameState::Submitted;
    }

    /// Called once the GPU reached `completed`.
    pub(crate) fn retire(&mut self, completed: u64) {
        if self.state == FrameState::Submitted && completed >= self.fence_value {
            self.state = FrameState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingAllocator {
        resets: u32,
    }

    impl CommandAllocator for CountingAllocator {
        fn reset(&mut self) -> FrameResult<()> {
            self.resets += 1;
            Ok(())
        }
    }

    #[test]
    fn lifecycle() {
        let mut ctx = FrameContext::new(1, CountingAllocator::default());
        assert_eq!(ctx.state(), FrameState::Idle);

        ctx.begin_recording().unwrap();
        assert_eq!(ctx.state(), FrameState::Recording);
        assert_eq!(ctx.allocator().resets, 1);

        ctx.mark_submitted(7);
        assert_eq!(ctx.state(), FrameState::Submitted);
        assert_eq!(ctx.fence_value(), 7);

        ctx.retire(6);
        assert_eq!(ctx.state(), FrameState::Submitted);
        ctx.retire(7);
        assert_eq!(ctx.state(), FrameState::Idle);
    }

    #[test]
    fn abandon_returns_to_idle_without_touching_fence() {
        let mut ctx = FrameContext::new(0, CountingAllocator::default());
        ctx.begin_recording().unwrap();
        ctx.abandon_recording();

        assert_eq!(ctx.state(), FrameState::Idle);
        assert_eq!(ctx.fence_value(), 0);
    }

    #[test]
    #[should_panic(expected = "must be idle")]
    fn recording_twice_panics() {
        let mut ctx = FrameContext::new(0, CountingAllocator::default());
        ctx.begin_recording().unwrap();
        ctx.begin_recording().unwrap();
    }
}
