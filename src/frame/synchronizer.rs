// Frame synchronizer
//
// Owns the timeline fence and the ring of frame contexts. The CPU may run up
// to N frames ahead of the GPU; `acquire_next_frame` is the one place the
// render thread blocks when it gets too far ahead.
//
// FRAME TIMELINE (N = 2):
// ┌──────────────────────────────────────────────────────────────────────┐
// │ acquire(slot 0) ─> record ─> submit_and_advance (fence -> 1)          │
// │ acquire(slot 1) ─> record ─> submit_and_advance (fence -> 2)          │
// │ acquire(slot 0) ─> wait until GPU completed >= 1 ─> record ...        │
// └──────────────────────────────────────────────────────────────────────┘

use std::time::Duration;

use super::{CommandAllocator, FrameContext, FrameLatencyWait, FrameState, TimelineFence};
use crate::error::FrameResult;

pub struct FrameSynchronizer<F, A> {
    fence: F,
    frames: Vec<FrameContext<A>>,
    /// Highest value ever handed to `fence.signal`.
    last_signaled_value: u64,
    /// Total frames submitted; the current slot is `frame_index % N`.
    frame_index: u64,
    /// `None` blocks forever.
    wait_timeout: Option<Duration>,
}

impl<F: TimelineFence, A: CommandAllocator> FrameSynchronizer<F, A> {
    /// One context per allocator; the number of allocators is the number
    /// of frames in flight.
    pub fn new(fence: F, allocators: Vec<A>) -> Self {
        assert!(!allocators.is_empty(), "need at least one frame in flight");

        let frames: Vec<_> = allocators
            .into_iter()
            .enumerate()
            .map(|(slot, allocator)| FrameContext::new(slot, allocator))
            .collect();

        log::info!("Frame synchronizer created with {} frames in flight", frames.len());

        Self {
            fence,
            frames,
            last_signaled_value: 0,
            frame_index: 0,
            wait_timeout: None,
        }
    }

    /// Bound every fence wait. Timing out surfaces as
    /// [`FrameError::FenceWaitTimedOut`](crate::error::FrameError::FenceWaitTimedOut).
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn last_signaled_value(&self) -> u64 {
        self.last_signaled_value
    }

    pub fn completed_value(&self) -> FrameResult<u64> {
        self.fence.completed_value()
    }

    pub fn fence(&self) -> &F {
        &self.fence
    }

    pub fn current_slot(&self) -> usize {
        (self.frame_index % self.frames.len() as u64) as usize
    }

    pub fn current_frame(&self) -> &FrameContext<A> {
        &self.frames[self.current_slot()]
    }

    pub fn current_frame_mut(&mut self) -> &mut FrameContext<A> {
        let slot = self.current_slot();
        &mut self.frames[slot]
    }

    pub fn frames(&self) -> &[FrameContext<A>] {
        &self.frames
    }

    /// Hand out the next ring slot once the GPU is done with it.
    ///
    /// Blocks until the slot's previous submission completed, then (if given)
    /// until the presentation engine can accept another frame.
    pub fn acquire_next_frame(
        &mut self,
        latency: Option<&mut dyn FrameLatencyWait>,
    ) -> FrameResult<&mut FrameContext<A>> {
        let slot = self.current_slot();
        let required = self.frames[slot].fence_value();

        assert_ne!(
            self.frames[slot].state(),
            FrameState::Recording,
            "frame slot {} acquired while still recording",
            slot
        );

        self.wait_for_value(required)?;
        self.frames[slot].retire(required);

        if let Some(latency) = latency {
            latency.wait_for_present_slot(slot)?;
        }

        Ok(&mut self.frames[slot])
    }

    /// Tie the current slot's reuse to the work just submitted.
    ///
    /// Must follow the queue submission of the slot's recording. Returns the
    /// fence value signaled for it.
    pub fn submit_and_advance(&mut self) -> FrameResult<u64> {
        let slot = self.current_slot();
        let value = self.last_signaled_value + 1;

        self.fence.signal(value)?;
        self.last_signaled_value = value;
        self.frames[slot].mark_submitted(value);
        self.frame_index += 1;

        log::trace!("Frame slot {} submitted, fence -> {}", slot, value);
        Ok(value)
    }

    /// Wait until the GPU has finished everything submitted so far.
    ///
    /// Required before destroying any resource a previous frame may still
    /// reference.
    pub fn drain_all(&mut self) -> FrameResult<()> {
        let value = self.last_signaled_value + 1;
        self.fence.signal(value)?;
        self.last_signaled_value = value;

        self.wait_for_value(value)?;
        for frame in &mut self.frames {
            frame.retire(value);
        }

        log::debug!("GPU drained at fence value {}", value);
        Ok(())
    }

    fn wait_for_value(&self, value: u64) -> FrameResult<()> {
        if self.fence.completed_value()? >= value {
            return Ok(());
        }
        log::trace!("Waiting for GPU to reach fence value {}", value);
        self.fence.wait(value, self.wait_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::frame::testing::{CountingLatency, RecordingAllocator, SimulatedTimeline};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn synchronizer(
        timeline: &SimulatedTimeline,
        n: usize,
    ) -> FrameSynchronizer<SimulatedTimeline, RecordingAllocator> {
        let allocators = (0..n)
            .map(|slot| RecordingAllocator::new(slot, timeline.clone()))
            .collect();
        FrameSynchronizer::new(timeline.clone(), allocators)
    }

    fn run_frame(sync: &mut FrameSynchronizer<SimulatedTimeline, RecordingAllocator>) -> u64 {
        sync.acquire_next_frame(None).unwrap().begin_recording().unwrap();
        sync.submit_and_advance().unwrap()
    }

    #[test]
    fn fence_values_increase_per_frame() {
        let timeline = SimulatedTimeline::auto_completing();
        let mut sync = synchronizer(&timeline, 2);

        assert_eq!(run_frame(&mut sync), 1);
        assert_eq!(run_frame(&mut sync), 2);
        assert_eq!(run_frame(&mut sync), 3);

        assert_eq!(sync.frame_index(), 3);
        assert_eq!(sync.frames()[0].fence_value(), 3);
        assert_eq!(sync.frames()[1].fence_value(), 2);
    }

    #[test]
    fn third_acquire_blocks_until_first_frame_completes() {
        let timeline = SimulatedTimeline::manual();
        let mut sync = synchronizer(&timeline, 2);

        assert_eq!(run_frame(&mut sync), 1);
        assert_eq!(run_frame(&mut sync), 2);
        assert_eq!(timeline.completed(), 0);

        let released = Arc::new(AtomicBool::new(false));
        let gpu = {
            let timeline = timeline.clone();
            let released = released.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                released.store(true, Ordering::SeqCst);
                timeline.complete_through(1);
            })
        };

        let ctx = sync.acquire_next_frame(None).unwrap();
        assert_eq!(ctx.slot(), 0);
        assert!(released.load(Ordering::SeqCst));
        assert!(timeline.completed() >= 1);
        assert_eq!(timeline.waits(), vec![1]);

        gpu.join().unwrap();
    }

    #[test]
    fn acquire_does_not_wait_when_gpu_is_ahead() {
        let timeline = SimulatedTimeline::manual();
        let mut sync = synchronizer(&timeline, 2);

        run_frame(&mut sync);
        run_frame(&mut sync);
        timeline.complete_through(2);

        sync.acquire_next_frame(None).unwrap();
        assert!(timeline.waits().is_empty());
    }

    #[test]
    fn latency_wait_runs_after_fence_wait() {
        let timeline = SimulatedTimeline::auto_completing();
        let mut sync = synchronizer(&timeline, 2);
        let mut latency = CountingLatency::default();

        sync.acquire_next_frame(Some(&mut latency)).unwrap().begin_recording().unwrap();
        sync.submit_and_advance().unwrap();
        sync.acquire_next_frame(Some(&mut latency)).unwrap();

        assert_eq!(latency.slots, vec![0, 1]);
    }

    #[test]
    fn drain_reaches_last_signaled_and_is_repeatable() {
        let timeline = SimulatedTimeline::completing_on_wait();
        let mut sync = synchronizer(&timeline, 2);

        run_frame(&mut sync);
        run_frame(&mut sync);

        sync.drain_all().unwrap();
        assert_eq!(timeline.completed(), sync.last_signaled_value());
        assert!(sync.frames().iter().all(|f| f.state() == FrameState::Idle));
        let slots_after_first: Vec<_> =
            sync.frames().iter().map(|f| (f.state(), f.fence_value())).collect();

        sync.drain_all().unwrap();
        assert_eq!(timeline.completed(), sync.last_signaled_value());
        let slots_after_second: Vec<_> =
            sync.frames().iter().map(|f| (f.state(), f.fence_value())).collect();
        assert_eq!(slots_after_first, slots_after_second);
        assert_eq!(sync.frame_index(), 2);
    }

    #[test]
    fn timeout_surfaces_as_error() {
        let timeline = SimulatedTimeline::manual();
        let mut sync =
            synchronizer(&timeline, 1).with_wait_timeout(Some(Duration::from_millis(10)));

        run_frame(&mut sync);
        match sync.acquire_next_frame(None) {
            Err(FrameError::FenceWaitTimedOut { value, completed }) => {
                assert_eq!(value, 1);
                assert_eq!(completed, 0);
            }
            other => panic!("expected timeout, got {:?}", other.map(|f| f.slot())),
        }
    }

    #[test]
    fn signal_failure_leaves_slot_recording_and_counter_untouched() {
        let timeline = SimulatedTimeline::auto_completing();
        let mut sync = synchronizer(&timeline, 2);

        sync.acquire_next_frame(None).unwrap().begin_recording().unwrap();
        timeline.fail_next_signal();
        assert!(sync.submit_and_advance().is_err());

        assert_eq!(sync.last_signaled_value(), 0);
        assert_eq!(sync.frame_index(), 0);
        assert_eq!(sync.current_frame().state(), FrameState::Recording);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Frame,
        /// Let the GPU finish this many outstanding signals.
        GpuProgress(u8),
        Drain,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => Just(Step::Frame),
            2 => (0u8..4).prop_map(Step::GpuProgress),
            1 => Just(Step::Drain),
        ]
    }

    proptest! {
        #[test]
        fn allocator_never_reset_before_its_fence_completes(
            n in 1usize..4,
            steps in proptest::collection::vec(step(), 1..120),
        ) {
            let timeline = SimulatedTimeline::completing_on_wait();
            let mut sync = synchronizer(&timeline, n);
            // Value each slot was last submitted with.
            let mut submitted = vec![0u64; n];

            for step in steps {
                match step {
                    Step::Frame => {
                        let slot = sync.current_slot();
                        run_frame(&mut sync);
                        submitted[slot] = sync.last_signaled_value();
                    }
                    Step::GpuProgress(k) => timeline.complete_pending(k as usize),
                    Step::Drain => sync.drain_all().unwrap(),
                }

                prop_assert!(timeline.completed() <= sync.last_signaled_value());
            }

            for reset in timeline.resets() {
                prop_assert!(
                    reset.completed_at_reset >= reset.required,
                    "slot {} reset at completed {} but needed {}",
                    reset.slot,
                    reset.completed_at_reset,
                    reset.required
                );
            }
            for (slot, frame) in sync.frames().iter().enumerate() {
                prop_assert_eq!(frame.fence_value(), submitted[slot]);
            }
        }
    }
}
