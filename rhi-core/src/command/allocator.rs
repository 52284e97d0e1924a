use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use hal::{Device as _, QueueType};

use crate::{device::DeviceError, fatal, fence::PendingSyncPoint, hal_api::HalApi, resource_log};

/// A raw command allocator and what is needed to know when it can be reset.
///
/// Command lists recording into an allocator keep it open. Once every list
/// is closed, the allocator is free to reset as soon as the GPU has passed
/// the sync point of the most recent list recorded into it.
pub struct CommandAllocator<A: HalApi> {
    raw: A::CommandAllocator,
    ty: QueueType,
    open_lists: Arc<AtomicU32>,
    sync_point: Option<PendingSyncPoint<A>>,
}

impl<A: HalApi> CommandAllocator<A> {
    pub(crate) fn new(device: &A::Device, ty: QueueType) -> Result<Self, DeviceError> {
        let raw = device.create_command_allocator(ty)?;
        resource_log!("Created {ty:?} command allocator");
        Ok(Self {
            raw,
            ty,
            open_lists: Arc::new(AtomicU32::new(0)),
            sync_point: None,
        })
    }

    pub fn ty(&self) -> QueueType {
        self.ty
    }

    pub fn raw(&self) -> &A::CommandAllocator {
        &self.raw
    }

    pub(crate) fn raw_mut(&mut self) -> &mut A::CommandAllocator {
        &mut self.raw
    }

    /// Number of command lists still recording into this allocator.
    pub fn open_lists(&self) -> u32 {
        self.open_lists.load(Ordering::Acquire)
    }

    /// Registers a command list that starts recording into this allocator.
    ///
    /// The returned counter must be decremented when the list closes.
    pub(crate) fn open_list(&mut self, sync_point: &PendingSyncPoint<A>) -> Arc<AtomicU32> {
        self.open_lists.fetch_add(1, Ordering::AcqRel);
        self.sync_point = Some(sync_point.clone());
        Arc::clone(&self.open_lists)
    }

    /// True when no list is recording and the GPU has finished every list
    /// recorded into this allocator.
    pub fn is_ready(&self) -> bool {
        self.open_lists() == 0
            && self
                .sync_point
                .as_ref()
                .map_or(true, PendingSyncPoint::is_complete)
    }

    pub(crate) fn reset(&mut self, device: &A::Device) -> Result<(), DeviceError> {
        if !self.is_ready() {
            fatal!(
                "{:?} command allocator reset with {} open lists before its sync point {:?}",
                self.ty,
                self.open_lists(),
                self.sync_point
            );
        }
        device.reset_command_allocator(&mut self.raw)?;
        self.sync_point = None;
        Ok(())
    }
}

impl<A: HalApi> fmt::Debug for CommandAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandAllocator")
            .field("ty", &self.ty)
            .field("open_lists", &self.open_lists())
            .field("sync_point", &self.sync_point)
            .finish()
    }
}

/// Recycles command allocators of one queue type.
///
/// The oldest released allocator that is ready is reused first.
pub struct CommandAllocatorManager<A: HalApi> {
    ty: QueueType,
    free: VecDeque<CommandAllocator<A>>,
    created: u32,
}

impl<A: HalApi> CommandAllocatorManager<A> {
    pub fn new(ty: QueueType) -> Self {
        Self {
            ty,
            free: VecDeque::new(),
            created: 0,
        }
    }

    pub fn obtain(&mut self, device: &A::Device) -> Result<CommandAllocator<A>, DeviceError> {
        let ready = self.free.iter().position(CommandAllocator::is_ready);
        if let Some(mut allocator) = ready.and_then(|index| self.free.remove(index)) {
            allocator.reset(device)?;
            return Ok(allocator);
        }
        self.created += 1;
        CommandAllocator::new(device, self.ty)
    }

    pub fn release(&mut self, allocator: CommandAllocator<A>) {
        if allocator.ty != self.ty {
            fatal!(
                "{:?} command allocator released to the {:?} pool",
                allocator.ty,
                self.ty
            );
        }
        self.free.push_back(allocator);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of allocators this manager has created.
    pub fn created(&self) -> u32 {
        self.created
    }
}

impl<A: HalApi> fmt::Debug for CommandAllocatorManager<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandAllocatorManager")
            .field("ty", &self.ty)
            .field("free", &self.free.len())
            .field("created", &self.created)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        fence::{Fence, SyncPoint, WaitSettings},
        Settings,
    };
    use hal::{
        api::Soft,
        soft::{self, ExecutionMode},
        Device as _,
    };

    #[test]
    fn allocators_are_reused_only_after_completion() {
        let device = soft::Device::new(ExecutionMode::Manual);
        let queue = device.create_queue(QueueType::Direct).unwrap();
        let fence = Arc::new(
            Fence::<Soft>::new(&device, "direct", WaitSettings::from(&Settings::default()))
                .unwrap(),
        );
        let mut manager = CommandAllocatorManager::new(QueueType::Direct);

        let mut allocator = manager.obtain(&device).unwrap();
        let pending = PendingSyncPoint::new();
        let open = allocator.open_list(&pending);
        assert!(!allocator.is_ready());
        open.fetch_sub(1, Ordering::AcqRel);
        // Closed but not submitted.
        assert!(!allocator.is_ready());
        manager.release(allocator);

        let other = manager.obtain(&device).unwrap();
        assert_eq!(manager.created(), 2);
        manager.release(other);

        pending.resolve(SyncPoint::new(Arc::clone(&fence), fence.signal(&queue).unwrap()));
        assert!(!pending.is_complete());
        device.run_gpu();

        let reused = manager.obtain(&device).unwrap();
        assert_eq!(manager.created(), 2);
        assert_eq!(reused.raw().reset_count(), 1);
        assert_eq!(manager.free_count(), 1);
    }

    #[test]
    fn a_stalled_allocator_does_not_block_later_ones() {
        let device = soft::Device::new(ExecutionMode::Manual);
        let queue = device.create_queue(QueueType::Direct).unwrap();
        let fence = Arc::new(
            Fence::<Soft>::new(&device, "direct", WaitSettings::from(&Settings::default()))
                .unwrap(),
        );
        let mut manager = CommandAllocatorManager::new(QueueType::Direct);

        // Its list never reaches the queue.
        let mut stalled = manager.obtain(&device).unwrap();
        let never = PendingSyncPoint::new();
        stalled.open_list(&never).fetch_sub(1, Ordering::AcqRel);
        manager.release(stalled);

        let mut allocator = manager.obtain(&device).unwrap();
        let pending = PendingSyncPoint::new();
        allocator.open_list(&pending).fetch_sub(1, Ordering::AcqRel);
        manager.release(allocator);
        pending.resolve(SyncPoint::new(Arc::clone(&fence), fence.signal(&queue).unwrap()));
        device.run_gpu();

        let reused = manager.obtain(&device).unwrap();
        assert_eq!(manager.created(), 2);
        assert_eq!(reused.raw().reset_count(), 1);
        assert_eq!(manager.free_count(), 1);
        assert!(!never.is_complete());
    }
}
