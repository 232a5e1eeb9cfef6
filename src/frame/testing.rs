// Simulated GPU for tests
//
// The test decides when the "GPU" makes progress, so fence ordering can be
// exercised with delayed and interleaved completion and no device.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{
    CommandAllocator, CpuDescriptorHandle, FrameLatencyWait, SwapChainSurface, TimelineFence,
};
use crate::error::{FrameError, FrameResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Signals complete immediately.
    Immediate,
    /// A blocked wait lets the GPU catch up to the awaited value.
    OnWait,
    /// Only `complete_through` / `complete_pending` move the GPU.
    Manual,
}

#[derive(Debug, Clone, Copy)]
pub struct ResetEvent {
    pub slot: usize,
    /// Fence value the slot's previous recording was submitted with.
    pub required: u64,
    pub completed_at_reset: u64,
}

struct TimelineState {
    signaled: u64,
    completed: u64,
    waits: Vec<u64>,
    resets: Vec<ResetEvent>,
    fail_next_signal: bool,
}

struct Shared {
    progress: Progress,
    state: Mutex<TimelineState>,
    reached: Condvar,
}

#[derive(Clone)]
pub struct SimulatedTimeline {
    shared: Arc<Shared>,
}

impl SimulatedTimeline {
    fn with_progress(progress: Progress) -> Self {
        Self {
            shared: Arc::new(Shared {
                progress,
                state: Mutex::new(TimelineState {
                    signaled: 0,
                    completed: 0,
                    waits: Vec::new(),
                    resets: Vec::new(),
                    fail_next_signal: false,
                }),
                reached: Condvar::new(),
            }),
        }
    }

    pub fn auto_completing() -> Self {
        Self::with_progress(Progress::Immediate)
    }

    pub fn completing_on_wait() -> Self {
        Self::with_progress(Progress::OnWait)
    }

    pub fn manual() -> Self {
        Self::with_progress(Progress::Manual)
    }

    pub fn completed(&self) -> u64 {
        self.shared.state.lock().completed
    }

    pub fn last_signaled(&self) -> u64 {
        self.shared.state.lock().signaled
    }

    /// Values passed to blocking waits, in call order.
    pub fn waits(&self) -> Vec<u64> {
        self.shared.state.lock().waits.clone()
    }

    pub fn resets(&self) -> Vec<ResetEvent> {
        self.shared.state.lock().resets.clone()
    }

    pub fn fail_next_signal(&self) {
        self.shared.state.lock().fail_next_signal = true;
    }

    /// GPU finishes everything up to `value` (capped at what was signaled).
    pub fn complete_through(&self, value: u64) {
        let mut state = self.shared.state.lock();
        state.completed = state.completed.max(value.min(state.signaled));
        self.shared.reached.notify_all();
    }

    /// GPU finishes the next `count` outstanding signals.
    pub fn complete_pending(&self, count: usize) {
        let mut state = self.shared.state.lock();
        state.completed = (state.completed + count as u64).min(state.signaled);
        self.shared.reached.notify_all();
    }

    fn record_reset(&self, slot: usize, required: u64) -> u64 {
        let mut state = self.shared.state.lock();
        let completed = state.completed;
        state.resets.push(ResetEvent {
            slot,
            required,
            completed_at_reset: completed,
        });
        state.signaled
    }
}

impl TimelineFence for SimulatedTimeline {
    fn signal(&self, value: u64) -> FrameResult<()> {
        let mut state = self.shared.state.lock();
        if std::mem::take(&mut state.fail_next_signal) {
            return Err(FrameError::DeviceLost);
        }
        assert!(value > state.signaled, "fence values must increase");
        state.signaled = value;
        if self.shared.progress == Progress::Immediate {
            state.completed = value;
            self.shared.reached.notify_all();
        }
        Ok(())
    }

    fn completed_value(&self) -> FrameResult<u64> {
        Ok(self.shared.state.lock().completed)
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> FrameResult<()> {
        let mut state = self.shared.state.lock();
        state.waits.push(value);

        if self.shared.progress == Progress::OnWait && state.completed < value {
            assert!(value <= state.signaled, "waiting on a value never signaled");
            state.completed = value;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while state.completed < value {
            match deadline {
                Some(deadline) => {
                    if self.shared.reached.wait_until(&mut state, deadline).timed_out()
                        && state.completed < value
                    {
                        return Err(FrameError::FenceWaitTimedOut {
                            value,
                            completed: state.completed,
                        });
                    }
                }
                None => self.shared.reached.wait(&mut state),
            }
        }
        Ok(())
    }
}

/// Logs every reset together with the GPU progress at that moment.
pub struct RecordingAllocator {
    slot: usize,
    timeline: SimulatedTimeline,
    /// Fence value of this slot's last submission. The synchronizer signals
    /// exactly one value between a reset and the next reset of another slot,
    /// so it is `last_signaled + 1` as seen at reset time.
    next_required: u64,
}

impl RecordingAllocator {
    pub fn new(slot: usize, timeline: SimulatedTimeline) -> Self {
        Self {
            slot,
            timeline,
            next_required: 0,
        }
    }
}

impl CommandAllocator for RecordingAllocator {
    fn reset(&mut self) -> FrameResult<()> {
        let signaled = self.timeline.record_reset(self.slot, self.next_required);
        self.next_required = signaled + 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingLatency {
    pub slots: Vec<usize>,
}

impl FrameLatencyWait for CountingLatency {
    fn wait_for_present_slot(&mut self, frame_slot: usize) -> FrameResult<()> {
        self.slots.push(frame_slot);
        Ok(())
    }
}

/// Back buffer in the fake swap chain: generation changes on every resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FakeBuffer {
    pub generation: u32,
    pub index: usize,
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct FakeView {
    pub buffer: FakeBuffer,
    pub slot: CpuDescriptorHandle,
}

pub struct FakeSwapChain {
    buffer_count: usize,
    pub generation: u32,
    pub extent: (u32, u32),
    pub live_views: HashSet<(FakeBuffer, CpuDescriptorHandle)>,
    pub fail_next_resize: bool,
    /// Buffers added by every successful resize.
    pub grow_on_resize: usize,
    pub resize_calls: u32,
    /// Set when a view was destroyed while the GPU had not caught up.
    pub destroyed_while_busy: bool,
    timeline: Option<SimulatedTimeline>,
}

impl FakeSwapChain {
    pub fn new(buffer_count: usize) -> Self {
        Self {
            buffer_count,
            generation: 0,
            extent: (640, 480),
            live_views: HashSet::new(),
            fail_next_resize: false,
            grow_on_resize: 0,
            resize_calls: 0,
            destroyed_while_busy: false,
            timeline: None,
        }
    }

    /// Check GPU idleness against `timeline` whenever a view is destroyed.
    pub fn observing(mut self, timeline: &SimulatedTimeline) -> Self {
        self.timeline = Some(timeline.clone());
        self
    }
}

impl SwapChainSurface for FakeSwapChain {
    type Buffer = FakeBuffer;
    type View = FakeView;

    fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn buffer(&self, index: usize) -> FrameResult<FakeBuffer> {
        assert!(index < self.buffer_count);
        Ok(FakeBuffer {
            generation: self.generation,
            index,
        })
    }

    fn create_view(
        &mut self,
        buffer: &FakeBuffer,
        slot: CpuDescriptorHandle,
    ) -> FrameResult<FakeView> {
        assert!(self.live_views.insert((*buffer, slot)), "view slot reused while live");
        Ok(FakeView { buffer: *buffer, slot })
    }

    fn destroy_view(&mut self, view: FakeView) {
        if let Some(timeline) = &self.timeline {
            if timeline.completed() < timeline.last_signaled() {
                self.destroyed_while_busy = true;
            }
        }
        assert!(self.live_views.remove(&(view.buffer, view.slot)), "unknown view destroyed");
    }

    fn resize_buffers(&mut self, width: u32, height: u32) -> FrameResult<()> {
        self.resize_calls += 1;
        assert!(self.live_views.is_empty(), "resize with live views");
        if std::mem::take(&mut self.fail_next_resize) {
            return Err(FrameError::Vulkan(ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        self.generation += 1;
        self.buffer_count += self.grow_on_resize;
        self.extent = (width, height);
        Ok(())
    }
}
