// Descriptor slot allocator
//
// Free-list over a fixed-capacity descriptor heap. All slots are the same
// size, so alloc/free are O(1) and the heap never fragments.

use crate::error::{FrameError, FrameResult};

/// CPU-side address of a descriptor slot (where it is written from).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub u64);

/// GPU-side address of a descriptor slot (what shaders index with).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

/// Device properties the allocator needs.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    /// Distance between two consecutive descriptor slots.
    pub descriptor_increment: u64,
}

/// Where a heap starts and how many slots it has.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeapDesc {
    pub cpu_start: CpuDescriptorHandle,
    pub gpu_start: GpuDescriptorHandle,
    pub capacity: u32,
}

impl DescriptorHeapDesc {
    /// Handle of `index` in a heap that hands out slots itself (no free list).
    pub fn cpu_handle(&self, caps: &DeviceCaps, index: u32) -> CpuDescriptorHandle {
        CpuDescriptorHandle(self.cpu_start.0 + u64::from(index) * caps.descriptor_increment)
    }
}

struct HeapState {
    cpu_start: u64,
    gpu_start: u64,
    increment: u64,
    capacity: u32,
    free_indices: Vec<u32>,
    /// `live[i]` is true while slot `i` is handed out.
    live: Vec<bool>,
}

impl HeapState {
    /// Slot both handles name, or `None` if they are not a valid pair in
    /// this heap.
    fn locate(&self, cpu: CpuDescriptorHandle, gpu: GpuDescriptorHandle) -> Option<u32> {
        let cpu_offset = cpu.0.checked_sub(self.cpu_start)?;
        let gpu_offset = gpu.0.checked_sub(self.gpu_start)?;
        if cpu_offset % self.increment != 0 || cpu_offset != gpu_offset {
            return None;
        }
        let index = cpu_offset / self.increment;
        (index < u64::from(self.capacity)).then_some(index as u32)
    }

    fn index_of(&self, cpu: CpuDescriptorHandle, gpu: GpuDescriptorHandle) -> u32 {
        assert!(
            cpu.0 >= self.cpu_start && gpu.0 >= self.gpu_start,
            "descriptor handle below heap start: {:?} / {:?}",
            cpu,
            gpu
        );
        let cpu_offset = cpu.0 - self.cpu_start;
        let gpu_offset = gpu.0 - self.gpu_start;
        assert!(
            cpu_offset % self.increment == 0 && gpu_offset % self.increment == 0,
            "descriptor handle not on a slot boundary: {:?} / {:?}",
            cpu,
            gpu
        );

        let cpu_index = cpu_offset / self.increment;
        let gpu_index = gpu_offset / self.increment;
        assert_eq!(
            cpu_index, gpu_index,
            "CPU and GPU descriptor handles point at different slots"
        );
        assert!(
            cpu_index < u64::from(self.capacity),
            "descriptor slot {} outside heap of {}",
            cpu_index,
            self.capacity
        );

        cpu_index as u32
    }
}

/// Hands out paired CPU/GPU descriptor handles from one heap.
///
/// The heap object itself is owned elsewhere; this only tracks which slots
/// are in use. Single-threaded: touched only from the render thread.
#[derive(Default)]
pub struct DescriptorHeapAllocator {
    heap: Option<HeapState>,
}

impl DescriptorHeapAllocator {
    /// Shorthand for `default()` followed by [`create`](Self::create).
    pub fn new(caps: &DeviceCaps, desc: &DescriptorHeapDesc) -> FrameResult<Self> {
        let mut allocator = Self::default();
        allocator.create(caps, desc)?;
        Ok(allocator)
    }

    /// Capture the heap layout and mark every slot free.
    ///
    /// Indices are pushed in descending order so the first `alloc` returns
    /// slot 0, then 1, and so on.
    pub fn create(&mut self, caps: &DeviceCaps, desc: &DescriptorHeapDesc) -> FrameResult<()> {
        if self.heap.is_some() {
            return Err(FrameError::HeapAlreadyCreated);
        }
        assert!(caps.descriptor_increment > 0, "descriptor increment must be non-zero");

        let free_indices: Vec<u32> = (0..desc.capacity).rev().collect();

        log::debug!(
            "Descriptor heap allocator created: {} slots, increment {}",
            desc.capacity,
            caps.descriptor_increment
        );

        self.heap = Some(HeapState {
            cpu_start: desc.cpu_start.0,
            gpu_start: desc.gpu_start.0,
            increment: caps.descriptor_increment,
            capacity: desc.capacity,
            free_indices,
            live: vec![false; desc.capacity as usize],
        });
        Ok(())
    }

    /// Take one free slot.
    pub fn alloc(&mut self) -> FrameResult<(CpuDescriptorHandle, GpuDescriptorHandle)> {
        let heap = self.heap.as_mut().ok_or(FrameError::HeapNotCreated)?;

        let index = heap
            .free_indices
            .pop()
            .ok_or(FrameError::DescriptorPoolExhausted { capacity: heap.capacity })?;
        debug_assert!(!heap.live[index as usize]);
        heap.live[index as usize] = true;

        let offset = u64::from(index) * heap.increment;
        Ok((
            CpuDescriptorHandle(heap.cpu_start + offset),
            GpuDescriptorHandle(heap.gpu_start + offset),
        ))
    }

    /// Return a slot. Panics on a mismatched pair or a slot that is not live.
    pub fn free(&mut self, cpu: CpuDescriptorHandle, gpu: GpuDescriptorHandle) {
        let heap = self
            .heap
            .as_mut()
            .expect("free() called on a descriptor allocator that was never created");

        let index = heap.index_of(cpu, gpu);
        assert!(
            heap.live[index as usize],
            "descriptor slot {} freed while not allocated",
            index
        );
        heap.live[index as usize] = false;
        heap.free_indices.push(index);
    }

    /// Forget the heap. Does not release the heap object.
    pub fn destroy(&mut self) {
        if let Some(heap) = self.heap.take() {
            let live = heap.capacity as usize - heap.free_indices.len();
            if live > 0 {
                log::warn!("Descriptor heap allocator destroyed with {} live slots", live);
            }
        }
    }

    pub fn is_created(&self) -> bool {
        self.heap.is_some()
    }

    pub fn capacity(&self) -> u32 {
        self.heap.as_ref().map_or(0, |h| h.capacity)
    }

    pub fn free_count(&self) -> u32 {
        self.heap.as_ref().map_or(0, |h| h.free_indices.len() as u32)
    }

    pub fn live_count(&self) -> u32 {
        self.capacity() - self.free_count()
    }

    /// Whether slot `index` is currently handed out.
    pub fn is_live(&self, index: u32) -> bool {
        self.heap
            .as_ref()
            .and_then(|h| h.live.get(index as usize).copied())
            .unwrap_or(false)
    }

    /// Slot index a handle pair refers to. `None` when the allocator has no
    /// heap or the pair does not name a slot of it.
    pub fn index_of(&self, cpu: CpuDescriptorHandle, gpu: GpuDescriptorHandle) -> Option<u32> {
        self.heap.as_ref().and_then(|h| h.locate(cpu, gpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn caps() -> DeviceCaps {
        DeviceCaps { descriptor_increment: 32 }
    }

    fn desc(capacity: u32) -> DescriptorHeapDesc {
        DescriptorHeapDesc {
            cpu_start: CpuDescriptorHandle(0x1000),
            gpu_start: GpuDescriptorHandle(0x9000_0000),
            capacity,
        }
    }

    #[test]
    fn index_of_rejects_foreign_handles() {
        let mut alloc = DescriptorHeapAllocator::new(&caps(), &desc(4)).unwrap();
        let (cpu, gpu) = alloc.alloc().unwrap();
        assert_eq!(alloc.index_of(cpu, gpu), Some(0));

        let base_gpu = GpuDescriptorHandle(0x9000_0000);
        // below the heap, misaligned, past the end, mismatched pair
        assert_eq!(alloc.index_of(CpuDescriptorHandle(0x0800), base_gpu), None);
        assert_eq!(alloc.index_of(CpuDescriptorHandle(0x1001), base_gpu), None);
        let past_end = (
            CpuDescriptorHandle(0x1000 + 4 * 32),
            GpuDescriptorHandle(0x9000_0000 + 4 * 32),
        );
        assert_eq!(alloc.index_of(past_end.0, past_end.1), None);
        assert_eq!(alloc.index_of(cpu, GpuDescriptorHandle(0x9000_0000 + 32)), None);

        assert_eq!(DescriptorHeapAllocator::default().index_of(cpu, gpu), None);
    }

    #[test]
    fn handles_are_base_plus_index_times_increment() {
        let mut alloc = DescriptorHeapAllocator::new(&caps(), &desc(8)).unwrap();

        let (cpu0, gpu0) = alloc.alloc().unwrap();
        let (cpu1, gpu1) = alloc.alloc().unwrap();

        assert_eq!(cpu0, CpuDescriptorHandle(0x1000));
        assert_eq!(gpu0, GpuDescriptorHandle(0x9000_0000));
        assert_eq!(cpu1, CpuDescriptorHandle(0x1000 + 32));
        assert_eq!(gpu1, GpuDescriptorHandle(0x9000_0000 + 32));
        assert_eq!(alloc.index_of(cpu1, gpu1), Some(1));
    }

    #[test]
    fn exhaustion_then_reuse() {
        let mut alloc = DescriptorHeapAllocator::new(&caps(), &desc(4)).unwrap();

        let handles: Vec<_> = (0..4).map(|_| alloc.alloc().unwrap()).collect();
        let distinct: HashSet<_> = handles.iter().copied().collect();
        assert_eq!(distinct.len(), 4);

        assert!(matches!(
            alloc.alloc(),
            Err(FrameError::DescriptorPoolExhausted { capacity: 4 })
        ));

        let (cpu, gpu) = handles[2];
        alloc.free(cpu, gpu);
        assert_eq!(alloc.alloc().unwrap(), (cpu, gpu));
    }

    #[test]
    fn create_twice_is_rejected() {
        let mut alloc = DescriptorHeapAllocator::new(&caps(), &desc(4)).unwrap();
        assert!(matches!(
            alloc.create(&caps(), &desc(4)),
            Err(FrameError::HeapAlreadyCreated)
        ));
    }

    #[test]
    fn alloc_before_create_fails() {
        let mut alloc = DescriptorHeapAllocator::default();
        assert!(matches!(alloc.alloc(), Err(FrameError::HeapNotCreated)));
    }

    #[test]
    fn destroy_allows_recreate() {
        let mut alloc = DescriptorHeapAllocator::new(&caps(), &desc(2)).unwrap();
        alloc.alloc().unwrap();
        alloc.destroy();

        assert!(!alloc.is_created());
        assert_eq!(alloc.capacity(), 0);

        alloc.create(&caps(), &desc(3)).unwrap();
        assert_eq!(alloc.free_count(), 3);
    }

    #[test]
    #[should_panic(expected = "freed while not allocated")]
    fn double_free_panics() {
        let mut alloc = DescriptorHeapAllocator::new(&caps(), &desc(4)).unwrap();
        let (cpu, gpu) = alloc.alloc().unwrap();
        alloc.free(cpu, gpu);
        alloc.free(cpu, gpu);
    }

    #[test]
    #[should_panic(expected = "different slots")]
    fn mismatched_pair_panics() {
        let mut alloc = DescriptorHeapAllocator::new(&caps(), &desc(4)).unwrap();
        let (cpu, _) = alloc.alloc().unwrap();
        let (_, gpu) = alloc.alloc().unwrap();
        alloc.free(cpu, gpu);
    }

    #[test]
    #[should_panic(expected = "slot boundary")]
    fn misaligned_handle_panics() {
        let mut alloc = DescriptorHeapAllocator::new(&caps(), &desc(4)).unwrap();
        let (cpu, gpu) = alloc.alloc().unwrap();
        alloc.free(CpuDescriptorHandle(cpu.0 + 1), gpu);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc,
        /// Free the n-th live handle (modulo live count).
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Alloc), any::<usize>().prop_map(Op::Free)]
    }

    proptest! {
        #[test]
        fn alloc_free_stays_a_bijection(
            capacity in 1u32..32,
            ops in proptest::collection::vec(op(), 0..200),
        ) {
            let mut alloc = DescriptorHeapAllocator::new(&caps(), &desc(capacity)).unwrap();
            let mut live: Vec<(CpuDescriptorHandle, GpuDescriptorHandle)> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc => match alloc.alloc() {
                        Ok(pair) => {
                            prop_assert!(!live.contains(&pair));
                            live.push(pair);
                        }
                        Err(FrameError::DescriptorPoolExhausted { .. }) => {
                            prop_assert_eq!(live.len() as u32, capacity);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    },
                    Op::Free(n) => {
                        if !live.is_empty() {
                            let (cpu, gpu) = live.swap_remove(n % live.len());
                            alloc.free(cpu, gpu);
                        }
                    }
                }

                prop_assert_eq!(alloc.live_count() + alloc.free_count(), capacity);
                prop_assert_eq!(alloc.live_count() as usize, live.len());
                for &(cpu, gpu) in &live {
                    let index = alloc.index_of(cpu, gpu).unwrap();
                    prop_assert!(alloc.is_live(index));
                }
            }
        }
    }
}
