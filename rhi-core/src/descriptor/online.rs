/*! Shader-visible descriptor heaps.
 *
 * Descriptor tables are copied into an online heap right before the draw or
 * dispatch that uses them. Three flavours exist:
 *
 * - [`GlobalOnlineHeap`]: one large heap per device. Its contents must stay
 *   stable while any command list may read them, so it never rolls over. It
 *   hands out fixed-size blocks to contexts and keeps a bump region for
 *   tables that live for the whole device lifetime.
 * - [`SubAllocatedOnlineHeap`]: a context's bump allocator inside one block
 *   of the global heap. Each block belongs to one command list at a time and
 *   returns to the global heap once that list's sync point completes.
 * - [`ThreadLocalOnlineHeap`]: a context-owned ring. It wraps around when
 *   every command list that used the start of the ring has completed, and
 *   otherwise swaps to another heap generation.
 *
 * After a rollover every descriptor table recorded on the current command
 * list must be rebound.
!*/

use std::{collections::VecDeque, fmt, sync::Arc};

use hal::{CpuDescriptor, DescriptorHeapType, Device as _, GpuDescriptor};
use parking_lot::Mutex;

use crate::{
    device::DeviceError, fatal, fence::PendingSyncPoint, hal_api::HalApi, resource_log,
};

pub trait OnlineHeap<A: HalApi>: hal::MaybeSendSync {
    fn heap(&self) -> &A::DescriptorHeap;
    fn ty(&self) -> DescriptorHeapType;
    fn can_reserve_slots(&self, count: u32) -> bool;
    /// Reserves `count` contiguous slots and returns the first one.
    ///
    /// Callers must check [`OnlineHeap::can_reserve_slots`] first.
    fn reserve_slots(&mut self, count: u32) -> u32;
    /// Makes room for new reservations.
    ///
    /// Returns `false` if no room could be made. On success, every table
    /// recorded on the current command list must be rebound.
    fn roll_over(&mut self, device: &A::Device) -> Result<bool, DeviceError>;
    fn next_slot_index(&self) -> u32;
    /// Moves the allocation cursor back, releasing the slots after `index`.
    fn set_next_slot(&mut self, index: u32);
    fn cpu_slot_handle(&self, slot: u32) -> CpuDescriptor;
    fn gpu_slot_handle(&self, slot: u32) -> GpuDescriptor;
    /// Starts the region of a new command list.
    fn set_current_command_list(&mut self, sync_point: &PendingSyncPoint<A>);
}

struct HeapSlots<A: HalApi> {
    raw: A::DescriptorHeap,
    cpu_start: CpuDescriptor,
    gpu_start: GpuDescriptor,
}

impl<A: HalApi> HeapSlots<A> {
    fn new(
        device: &A::Device,
        label: &str,
        ty: DescriptorHeapType,
        count: u32,
    ) -> Result<Self, DeviceError> {
        let raw = device.create_descriptor_heap(&hal::DescriptorHeapDescriptor {
            label: Some(label),
            ty,
            count,
            shader_visible: true,
        })?;
        resource_log!("Created online {ty:?} heap {label:?} of {count} descriptors");
        Ok(Self {
            cpu_start: device.heap_cpu_start(&raw),
            gpu_start: device.heap_gpu_start(&raw),
            raw,
        })
    }
}

/// A range `[base, base + size)` of a global heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OnlineHeapBlock {
    pub base: u32,
    pub size: u32,
}

impl OnlineHeapBlock {
    pub fn end(&self) -> u32 {
        self.base + self.size
    }
}

struct GlobalHeapState<A: HalApi> {
    /// Start of the region never handed out.
    next_unused: u32,
    free: VecDeque<OnlineHeapBlock>,
    /// Blocks waiting for the last command list that used them.
    retired: VecDeque<(OnlineHeapBlock, PendingSyncPoint<A>)>,
}

pub struct GlobalOnlineHeap<A: HalApi> {
    slots: HeapSlots<A>,
    ty: DescriptorHeapType,
    size: u32,
    block_size: u32,
    increment: u32,
    state: Mutex<GlobalHeapState<A>>,
}

impl<A: HalApi> GlobalOnlineHeap<A> {
    pub fn new(
        device: &A::Device,
        ty: DescriptorHeapType,
        size: u32,
        block_size: u32,
    ) -> Result<Self, DeviceError> {
        let label = match ty {
            DescriptorHeapType::Sampler => "global sampler heap",
            _ => "global view heap",
        };
        Ok(Self {
            slots: HeapSlots::new(device, label, ty, size)?,
            ty,
            size,
            block_size: block_size.clamp(1, size),
            increment: device.descriptor_increment(ty),
            state: Mutex::new(GlobalHeapState {
                next_unused: 0,
                free: VecDeque::new(),
                retired: VecDeque::new(),
            }),
        })
    }

    pub fn raw(&self) -> &A::DescriptorHeap {
        &self.slots.raw
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Hands out a block no in-flight command list can still read.
    pub fn obtain_block(&self) -> Option<OnlineHeapBlock> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        // Lists may complete out of retirement order across queues.
        let free = &mut state.free;
        state.retired.retain(|&(block, ref sync_point)| {
            let complete = sync_point.is_complete();
            if complete {
                free.push_back(block);
            }
            !complete
        });
        if let Some(block) = state.free.pop_front() {
            return Some(block);
        }
        if state.next_unused + self.block_size <= self.size {
            let block = OnlineHeapBlock {
                base: state.next_unused,
                size: self.block_size,
            };
            state.next_unused += self.block_size;
            return Some(block);
        }
        None
    }

    /// Returns a block once the command list behind `sync_point` completes.
    pub fn retire_block(&self, block: OnlineHeapBlock, sync_point: PendingSyncPoint<A>) {
        self.state.lock().retired.push_back((block, sync_point));
    }

    /// Returns a block nothing was ever written to.
    pub fn release_unused_block(&self, block: OnlineHeapBlock) {
        self.state.lock().free.push_back(block);
    }

    pub fn free_block_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// True if `count` slots fit in the region never handed out.
    pub fn can_reserve(&self, count: u32) -> bool {
        self.state.lock().next_unused + count <= self.size
    }

    /// Permanently reserves `count` slots.
    pub fn try_reserve(&self, count: u32) -> Option<u32> {
        let mut state = self.state.lock();
        if state.next_unused + count > self.size {
            return None;
        }
        let slot = state.next_unused;
        state.next_unused += count;
        Some(slot)
    }

    pub fn cpu_handle(&self, slot: u32) -> CpuDescriptor {
        self.slots.cpu_start.offset(slot, self.increment)
    }

    pub fn gpu_handle(&self, slot: u32) -> GpuDescriptor {
        self.slots.gpu_start.offset(slot, self.increment)
    }
}

impl<A: HalApi> OnlineHeap<A> for GlobalOnlineHeap<A> {
    fn heap(&self) -> &A::DescriptorHeap {
        &self.slots.raw
    }

    fn ty(&self) -> DescriptorHeapType {
        self.ty
    }

    fn can_reserve_slots(&self, count: u32) -> bool {
        self.can_reserve(count)
    }

    fn reserve_slots(&mut self, count: u32) -> u32 {
        match self.try_reserve(count) {
            Some(slot) => slot,
            None => fatal!("Global {:?} heap cannot reserve {count} slots", self.ty),
        }
    }

    fn roll_over(&mut self, _device: &A::Device) -> Result<bool, DeviceError> {
        fatal!(
            "Global {:?} heap rolled over; its contents may be in use by in-flight command lists",
            self.ty
        )
    }

    fn next_slot_index(&self) -> u32 {
        self.state.lock().next_unused
    }

    fn set_next_slot(&mut self, index: u32) {
        let mut state = self.state.lock();
        if index > state.next_unused {
            fatal!("Slot {index} was never reserved in the global {:?} heap", self.ty);
        }
        state.next_unused = index;
    }

    fn cpu_slot_handle(&self, slot: u32) -> CpuDescriptor {
        self.cpu_handle(slot)
    }

    fn gpu_slot_handle(&self, slot: u32) -> GpuDescriptor {
        self.gpu_handle(slot)
    }

    fn set_current_command_list(&mut self, _sync_point: &PendingSyncPoint<A>) {}
}

impl<A: HalApi> fmt::Debug for GlobalOnlineHeap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalOnlineHeap")
            .field("ty", &self.ty)
            .field("size", &self.size)
            .field("block_size", &self.block_size)
            .finish()
    }
}

pub struct SubAllocatedOnlineHeap<A: HalApi> {
    global: Arc<GlobalOnlineHeap<A>>,
    block: Option<OnlineHeapBlock>,
    next_slot: u32,
    current_list: PendingSyncPoint<A>,
}

impl<A: HalApi> SubAllocatedOnlineHeap<A> {
    pub fn new(global: Arc<GlobalOnlineHeap<A>>) -> Self {
        let block = global.obtain_block();
        Self {
            next_slot: block.map_or(0, |block| block.base),
            block,
            global,
            current_list: PendingSyncPoint::new(),
        }
    }

    pub fn block(&self) -> Option<OnlineHeapBlock> {
        self.block
    }

    fn retire_current(&mut self) {
        if let Some(block) = self.block.take() {
            if self.next_slot == block.base {
                self.global.release_unused_block(block);
            } else {
                self.global.retire_block(block, self.current_list.clone());
            }
        }
    }

    fn obtain(&mut self) -> bool {
        self.block = self.global.obtain_block();
        match self.block {
            Some(block) => {
                self.next_slot = block.base;
                true
            }
            None => false,
        }
    }
}

impl<A: HalApi> OnlineHeap<A> for SubAllocatedOnlineHeap<A> {
    fn heap(&self) -> &A::DescriptorHeap {
        self.global.raw()
    }

    fn ty(&self) -> DescriptorHeapType {
        self.global.ty
    }

    fn can_reserve_slots(&self, count: u32) -> bool {
        self.block
            .map_or(false, |block| self.next_slot + count <= block.end())
    }

    fn reserve_slots(&mut self, count: u32) -> u32 {
        if !self.can_reserve_slots(count) {
            fatal!(
                "Sub-allocated {:?} heap block {:?} cannot reserve {count} slots",
                self.global.ty,
                self.block
            );
        }
        let slot = self.next_slot;
        self.next_slot += count;
        slot
    }

    fn roll_over(&mut self, _device: &A::Device) -> Result<bool, DeviceError> {
        self.retire_current();
        if self.obtain() {
            Ok(true)
        } else {
            log::warn!(
                "Global {:?} heap has no free block left for sub-allocation",
                self.global.ty
            );
            Ok(false)
        }
    }

    fn next_slot_index(&self) -> u32 {
        self.next_slot
    }

    fn set_next_slot(&mut self, index: u32) {
        match self.block {
            Some(block) if block.base <= index && index <= self.next_slot => {
                self.next_slot = index
            }
            _ => fatal!("Slot {index} is outside the reserved part of {:?}", self.block),
        }
    }

    fn cpu_slot_handle(&self, slot: u32) -> CpuDescriptor {
        self.global.cpu_handle(slot)
    }

    fn gpu_slot_handle(&self, slot: u32) -> GpuDescriptor {
        self.global.gpu_handle(slot)
    }

    fn set_current_command_list(&mut self, sync_point: &PendingSyncPoint<A>) {
        if self.current_list.ptr_eq(sync_point) {
            return;
        }
        // A used block belongs to the previous command list.
        if self.block.map_or(false, |block| self.next_slot != block.base) {
            self.retire_current();
            self.obtain();
        } else if self.block.is_none() {
            self.obtain();
        }
        self.current_list = sync_point.clone();
    }
}

impl<A: HalApi> Drop for SubAllocatedOnlineHeap<A> {
    fn drop(&mut self) {
        // A list that was never executed can't be read by the GPU.
        if self.current_list.get().is_none() {
            if let Some(block) = self.block.take() {
                self.global.release_unused_block(block);
            }
        }
        self.retire_current();
    }
}

struct Generation<A: HalApi> {
    slots: HeapSlots<A>,
    index: u32,
}

/// A ring of descriptors owned by one context.
///
/// Positions are virtual: they grow forever and map to slot
/// `position % size`. A region stays live until the sync point of the
/// command list that reserved it completes, and the head may never get more
/// than one ring ahead of the oldest live region.
pub struct ThreadLocalOnlineHeap<A: HalApi> {
    label: &'static str,
    ty: DescriptorHeapType,
    size: u32,
    increment: u32,
    current: Generation<A>,
    generations: u32,
    head: u64,
    /// Position of the first slot used by the current command list.
    list_start: u64,
    current_list: PendingSyncPoint<A>,
    /// Regions of earlier command lists on the current generation, oldest
    /// first, as (start position, sync point).
    in_flight: VecDeque<(u64, PendingSyncPoint<A>)>,
    /// Generations swapped out while still in use.
    reclaim: VecDeque<(Generation<A>, PendingSyncPoint<A>)>,
}

impl<A: HalApi> ThreadLocalOnlineHeap<A> {
    pub fn new(
        device: &A::Device,
        label: &'static str,
        ty: DescriptorHeapType,
        size: u32,
    ) -> Result<Self, DeviceError> {
        Ok(Self {
            label,
            ty,
            size,
            increment: device.descriptor_increment(ty),
            current: Generation {
                slots: HeapSlots::new(device, label, ty, size)?,
                index: 0,
            },
            generations: 1,
            head: 0,
            list_start: 0,
            current_list: PendingSyncPoint::new(),
            in_flight: VecDeque::new(),
            reclaim: VecDeque::new(),
        })
    }

    /// Index of the heap generation in use. Changes whenever a rollover had
    /// to swap heaps.
    pub fn generation(&self) -> u32 {
        self.current.index
    }

    /// Number of heaps created so far.
    pub fn generations_created(&self) -> u32 {
        self.generations
    }

    fn physical(&self, position: u64) -> u32 {
        (position % u64::from(self.size)) as u32
    }

    fn prune_completed(&mut self) {
        while self
            .in_flight
            .front()
            .map_or(false, |(_, sync_point)| sync_point.is_complete())
        {
            self.in_flight.pop_front();
        }
    }

    /// Start of the oldest region that may still be read.
    fn tail(&self) -> u64 {
        self.in_flight
            .front()
            .map_or(self.list_start, |&(start, _)| start)
    }

    fn swap_generation(&mut self, device: &A::Device) -> Result<(), DeviceError> {
        let reusable = self
            .reclaim
            .front()
            .map_or(false, |(_, sync_point)| sync_point.is_complete());
        let next = match self.reclaim.pop_front() {
            Some((generation, _)) if reusable => generation,
            other => {
                if let Some(entry) = other {
                    self.reclaim.push_front(entry);
                }
                log::warn!(
                    "Online {:?} heap {:?} rolled over while the GPU still uses it; \
                     creating heap generation {}. Increase its size to avoid this.",
                    self.ty,
                    self.label,
                    self.generations
                );
                let generation = Generation {
                    slots: HeapSlots::new(device, self.label, self.ty, self.size)?,
                    index: self.generations,
                };
                self.generations += 1;
                generation
            }
        };
        let previous = std::mem::replace(&mut self.current, next);
        self.reclaim.push_back((previous, self.current_list.clone()));
        self.in_flight.clear();
        self.head = 0;
        self.list_start = 0;
        Ok(())
    }
}

impl<A: HalApi> OnlineHeap<A> for ThreadLocalOnlineHeap<A> {
    fn heap(&self) -> &A::DescriptorHeap {
        &self.current.slots.raw
    }

    fn ty(&self) -> DescriptorHeapType {
        self.ty
    }

    fn can_reserve_slots(&self, count: u32) -> bool {
        let count = u64::from(count);
        u64::from(self.physical(self.head)) + count <= u64::from(self.size)
            && self.head + count <= self.tail() + u64::from(self.size)
    }

    fn reserve_slots(&mut self, count: u32) -> u32 {
        if !self.can_reserve_slots(count) {
            fatal!(
                "Online {:?} heap {:?} cannot reserve {count} slots at {}",
                self.ty,
                self.label,
                self.physical(self.head)
            );
        }
        let slot = self.physical(self.head);
        self.head += u64::from(count);
        slot
    }

    fn roll_over(&mut self, device: &A::Device) -> Result<bool, DeviceError> {
        self.prune_completed();
        let physical = self.physical(self.head);
        let wrapped = self.head - u64::from(physical) + u64::from(self.size);
        if physical != 0 && wrapped < self.tail() + u64::from(self.size) {
            // Everything before the oldest live region is free again.
            log::debug!(
                "Online {:?} heap {:?} wrapped around",
                self.ty,
                self.label
            );
            self.head = wrapped;
        } else {
            self.swap_generation(device)?;
        }
        Ok(true)
    }

    fn next_slot_index(&self) -> u32 {
        self.physical(self.head)
    }

    fn set_next_slot(&mut self, index: u32) {
        let physical = self.physical(self.head);
        let mut position = self.head - u64::from(physical) + u64::from(index);
        if position > self.head {
            position = position.saturating_sub(u64::from(self.size));
        }
        if index >= self.size || position < self.list_start || position > self.head {
            fatal!(
                "Slot {index} is outside the region reserved by the current command list"
            );
        }
        self.head = position;
    }

    fn cpu_slot_handle(&self, slot: u32) -> CpuDescriptor {
        self.current.slots.cpu_start.offset(slot, self.increment)
    }

    fn gpu_slot_handle(&self, slot: u32) -> GpuDescriptor {
        self.current.slots.gpu_start.offset(slot, self.increment)
    }

    fn set_current_command_list(&mut self, sync_point: &PendingSyncPoint<A>) {
        if self.current_list.ptr_eq(sync_point) {
            return;
        }
        let previous = std::mem::replace(&mut self.current_list, sync_point.clone());
        if self.head != self.list_start {
            self.in_flight.push_back((self.list_start, previous));
        }
        self.list_start = self.head;
        self.prune_completed();
    }
}

impl<A: HalApi> fmt::Debug for ThreadLocalOnlineHeap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalOnlineHeap")
            .field("label", &self.label)
            .field("ty", &self.ty)
            .field("generation", &self.current.index)
            .field("head", &self.head)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fence::{Fence, SyncPoint, WaitSettings};
    use hal::{
        api::Soft,
        soft::{self, ExecutionMode},
        Device as _,
    };

    struct Timeline {
        device: soft::Device,
        queue: soft::Queue,
        fence: Arc<Fence<Soft>>,
    }

    impl Timeline {
        fn new() -> Self {
            let device = soft::Device::new(ExecutionMode::Manual);
            let queue = device.create_queue(hal::QueueType::Direct).unwrap();
            let fence = Fence::new(
                &device,
                "online",
                WaitSettings {
                    slice_ms: 1,
                    timeout_ms: 10,
                },
            )
            .unwrap();
            Self {
                device,
                queue,
                fence: Arc::new(fence),
            }
        }

        /// Submits a command list: resolves its sync point to a new signal.
        fn submit(&self, pending: &PendingSyncPoint<Soft>) {
            let value = self.fence.signal(&self.queue).unwrap();
            pending.resolve(SyncPoint::new(Arc::clone(&self.fence), value));
        }
    }

    #[test]
    fn ring_reservations_never_overlap_live_regions() {
        let timeline = Timeline::new();
        let mut heap = ThreadLocalOnlineHeap::<Soft>::new(
            &timeline.device,
            "ring",
            DescriptorHeapType::CbvSrvUav,
            64,
        )
        .unwrap();

        // (generation, first slot, count, owner)
        let mut live: Vec<(u32, u32, u32, PendingSyncPoint<Soft>)> = Vec::new();
        let mut seed = 0x2545_f491_u32;
        let mut random = move |bound: u32| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed % bound
        };

        for _ in 0..40 {
            let list = PendingSyncPoint::new();
            heap.set_current_command_list(&list);
            for _ in 0..random(4) + 1 {
                let count = random(12) + 1;
                // A wrap may free less than needed; swapping heaps never does.
                while !heap.can_reserve_slots(count) {
                    assert!(heap.roll_over(&timeline.device).unwrap());
                }
                let slot = heap.reserve_slots(count);
                let generation = heap.generation();
                live.retain(|(_, _, _, owner)| !owner.is_complete());
                for &(other_generation, other_slot, other_count, _) in live.iter() {
                    let disjoint = other_generation != generation
                        || slot + count <= other_slot
                        || other_slot + other_count <= slot;
                    assert!(disjoint, "overlap at slot {slot} in generation {generation}");
                }
                live.push((generation, slot, count, list.clone()));
            }
            timeline.submit(&list);
            for _ in 0..random(3) {
                timeline.device.step_gpu();
            }
        }
    }

    #[test]
    fn ring_wraps_once_earlier_lists_complete() {
        let timeline = Timeline::new();
        let mut heap = ThreadLocalOnlineHeap::<Soft>::new(
            &timeline.device,
            "ring",
            DescriptorHeapType::Sampler,
            16,
        )
        .unwrap();

        let first = PendingSyncPoint::new();
        heap.set_current_command_list(&first);
        assert_eq!(heap.reserve_slots(10), 0);
        timeline.submit(&first);
        timeline.device.run_gpu();

        let second = PendingSyncPoint::new();
        heap.set_current_command_list(&second);
        assert_eq!(heap.reserve_slots(4), 10);
        assert!(!heap.can_reserve_slots(4));
        assert!(heap.roll_over(&timeline.device).unwrap());
        assert_eq!(heap.generation(), 0);
        // The second list still owns 10..14.
        assert_eq!(heap.reserve_slots(10), 0);
        assert!(!heap.can_reserve_slots(1));

        assert!(heap.roll_over(&timeline.device).unwrap());
        assert_eq!(heap.generation(), 1);
        assert_eq!(heap.generations_created(), 2);
        assert_eq!(heap.reserve_slots(16), 0);
    }

    #[test]
    fn completed_generations_are_reused() {
        let timeline = Timeline::new();
        let mut heap = ThreadLocalOnlineHeap::<Soft>::new(
            &timeline.device,
            "ring",
            DescriptorHeapType::CbvSrvUav,
            8,
        )
        .unwrap();
        let list = PendingSyncPoint::new();
        heap.set_current_command_list(&list);
        heap.reserve_slots(8);
        heap.roll_over(&timeline.device).unwrap();
        heap.reserve_slots(8);
        heap.roll_over(&timeline.device).unwrap();
        assert_eq!(heap.generations_created(), 3);

        timeline.submit(&list);
        timeline.device.run_gpu();
        let next = PendingSyncPoint::new();
        heap.set_current_command_list(&next);
        heap.reserve_slots(8);
        heap.roll_over(&timeline.device).unwrap();
        assert_eq!(heap.generations_created(), 3);
        assert_eq!(heap.generation(), 0);
    }

    #[test]
    fn rewinding_releases_the_tail() {
        let timeline = Timeline::new();
        let mut heap = ThreadLocalOnlineHeap::<Soft>::new(
            &timeline.device,
            "ring",
            DescriptorHeapType::CbvSrvUav,
            8,
        )
        .unwrap();
        heap.set_current_command_list(&PendingSyncPoint::new());
        let slot = heap.reserve_slots(5);
        heap.set_next_slot(slot + 2);
        assert_eq!(heap.next_slot_index(), 2);
        assert!(heap.can_reserve_slots(6));
    }

    #[test]
    fn sub_allocated_blocks_return_after_completion() {
        let timeline = Timeline::new();
        let global = Arc::new(
            GlobalOnlineHeap::<Soft>::new(&timeline.device, DescriptorHeapType::CbvSrvUav, 32, 16)
                .unwrap(),
        );
        let mut a = SubAllocatedOnlineHeap::new(Arc::clone(&global));
        let mut b = SubAllocatedOnlineHeap::new(Arc::clone(&global));
        assert_eq!(a.block().map(|block| block.base), Some(0));
        assert_eq!(b.block().map(|block| block.base), Some(16));

        let list = PendingSyncPoint::new();
        a.set_current_command_list(&list);
        assert_eq!(a.reserve_slots(16), 0);
        assert!(!a.can_reserve_slots(1));
        // Both blocks are taken and nothing has completed.
        assert!(!a.roll_over(&timeline.device).unwrap());
        assert!(!a.can_reserve_slots(1));

        timeline.submit(&list);
        timeline.device.run_gpu();
        assert!(a.roll_over(&timeline.device).unwrap());
        assert_eq!(a.block().map(|block| block.base), Some(0));

        // Unused blocks go straight back to the free list.
        b.set_current_command_list(&PendingSyncPoint::new());
        drop(b);
        assert_eq!(global.free_block_count(), 1);
    }

    #[test]
    fn dropping_before_submission_frees_the_block() {
        let timeline = Timeline::new();
        let global = Arc::new(
            GlobalOnlineHeap::<Soft>::new(&timeline.device, DescriptorHeapType::CbvSrvUav, 32, 16)
                .unwrap(),
        );
        let mut heap = SubAllocatedOnlineHeap::new(Arc::clone(&global));
        heap.set_current_command_list(&PendingSyncPoint::new());
        assert_eq!(heap.reserve_slots(4), 0);
        assert_eq!(global.free_block_count(), 0);

        // The list never reached a queue, so nothing can still read the block.
        drop(heap);
        assert_eq!(global.free_block_count(), 1);
        assert!(global.obtain_block().is_some());
        assert!(global.obtain_block().is_some());
    }

    #[test]
    fn completed_blocks_are_found_behind_pending_ones() {
        let timeline = Timeline::new();
        let global = Arc::new(
            GlobalOnlineHeap::<Soft>::new(&timeline.device, DescriptorHeapType::CbvSrvUav, 32, 16)
                .unwrap(),
        );
        let mut a = SubAllocatedOnlineHeap::new(Arc::clone(&global));
        let mut b = SubAllocatedOnlineHeap::new(Arc::clone(&global));

        // The first block retires with a list that is still pending.
        let stalled = PendingSyncPoint::new();
        a.set_current_command_list(&stalled);
        a.reserve_slots(2);
        assert!(!a.roll_over(&timeline.device).unwrap());

        let list = PendingSyncPoint::new();
        b.set_current_command_list(&list);
        b.reserve_slots(2);
        assert!(!b.roll_over(&timeline.device).unwrap());
        timeline.submit(&list);
        timeline.device.run_gpu();

        let c = SubAllocatedOnlineHeap::new(Arc::clone(&global));
        assert_eq!(c.block().map(|block| block.base), Some(16));
        assert!(!stalled.is_complete());
    }

    #[test]
    fn global_heap_bump_reservations() {
        let timeline = Timeline::new();
        let mut global =
            GlobalOnlineHeap::<Soft>::new(&timeline.device, DescriptorHeapType::Sampler, 8, 4)
                .unwrap();
        assert_eq!(global.reserve_slots(3), 0);
        assert_eq!(global.try_reserve(3), Some(3));
        assert!(!global.can_reserve_slots(3));
        assert_eq!(global.obtain_block(), None);
        assert_eq!(
            global.gpu_slot_handle(2),
            global.gpu_handle(0).offset(2, timeline.device.descriptor_increment(DescriptorHeapType::Sampler))
        );
    }

    #[test]
    #[should_panic(expected = "rolled over")]
    fn global_heap_never_rolls_over() {
        let timeline = Timeline::new();
        let mut global =
            GlobalOnlineHeap::<Soft>::new(&timeline.device, DescriptorHeapType::CbvSrvUav, 8, 4)
                .unwrap();
        let _ = global.roll_over(&timeline.device);
    }
}
