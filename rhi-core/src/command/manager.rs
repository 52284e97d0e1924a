use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use hal::{Device as _, Queue as _, QueueType};
use parking_lot::Mutex;
use smallvec::SmallVec;
use thiserror::Error;

use super::{BarrierBatcher, CommandAllocator, CommandAllocatorManager, CommandList};
use crate::{
    api_log,
    device::DeviceError,
    fence::{Fence, SyncPoint, WaitSettings},
    hal_api::HalApi,
    FenceValue, Settings,
};

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ExecuteError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Command list {0} was executed while still recording")]
    NotClosed(u32),
    #[error("{list:?} command list executed on a {queue:?} queue")]
    WrongQueue { list: QueueType, queue: QueueType },
}

struct PoolState<A: HalApi> {
    allocators: CommandAllocatorManager<A>,
    free_lists: Vec<CommandList<A>>,
}

/// Counts kept by a [`CommandListManager`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecuteStats {
    pub command_lists: u64,
    pub barrier_lists: u64,
    pub submissions: u64,
}

/// Owns one queue, its fence, and the pools of command lists and allocators
/// used with it.
pub struct CommandListManager<A: HalApi> {
    ty: QueueType,
    queue: A::Queue,
    fence: Arc<Fence<A>>,
    max_per_batch: usize,
    /// Held for the whole of an execution so that pending transitions are
    /// resolved in submission order.
    pool: Mutex<PoolState<A>>,
    command_lists: AtomicU64,
    barrier_lists: AtomicU64,
    submissions: AtomicU64,
}

impl<A: HalApi> CommandListManager<A> {
    pub(crate) fn new(
        device: &A::Device,
        ty: QueueType,
        settings: &Settings,
    ) -> Result<Self, DeviceError> {
        let queue = device.create_queue(ty)?;
        let fence = Fence::new(device, &format!("{ty:?} queue"), WaitSettings::from(settings))?;
        Ok(Self {
            ty,
            queue,
            fence: Arc::new(fence),
            max_per_batch: settings.max_command_lists_per_batch.max(1),
            pool: Mutex::new(PoolState {
                allocators: CommandAllocatorManager::new(ty),
                free_lists: Vec::new(),
            }),
            command_lists: AtomicU64::new(0),
            barrier_lists: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
        })
    }

    pub fn ty(&self) -> QueueType {
        self.ty
    }

    pub fn queue(&self) -> &A::Queue {
        &self.queue
    }

    pub fn fence(&self) -> &Arc<Fence<A>> {
        &self.fence
    }

    pub fn obtain_allocator(&self, device: &A::Device) -> Result<CommandAllocator<A>, DeviceError> {
        self.pool.lock().allocators.obtain(device)
    }

    pub fn release_allocator(&self, allocator: CommandAllocator<A>) {
        self.pool.lock().allocators.release(allocator);
    }

    /// Returns a recording command list, reusing an executed one if possible.
    pub fn obtain_command_list(
        &self,
        device: &A::Device,
        allocator: &mut CommandAllocator<A>,
    ) -> Result<CommandList<A>, DeviceError> {
        let reused = self.pool.lock().free_lists.pop();
        Self::prepare_list(device, self.ty, reused, allocator)
    }

    fn prepare_list(
        device: &A::Device,
        ty: QueueType,
        reused: Option<CommandList<A>>,
        allocator: &mut CommandAllocator<A>,
    ) -> Result<CommandList<A>, DeviceError> {
        match reused {
            Some(mut list) => {
                list.reset(allocator)?;
                Ok(list)
            }
            None => CommandList::new(device, ty, allocator),
        }
    }

    /// Returns an executed, or never used but closed, command list to the pool.
    pub fn release_command_list(&self, list: CommandList<A>) {
        if !list.is_closed() {
            crate::fatal!("Command list {} released while recording", list.id());
        }
        self.pool.lock().free_lists.push(list);
    }

    /// Executes closed command lists in order and returns the sync point of
    /// the last one.
    ///
    /// Lists are submitted in batches of at most
    /// [`Settings::max_command_lists_per_batch`], with one fence signal per
    /// batch. Pending transitions of each list are resolved into a barrier
    /// list submitted just before it. Every list's sync point is resolved,
    /// and the lists go back to the pool.
    pub fn execute_command_lists(
        &self,
        device: &A::Device,
        lists: Vec<CommandList<A>>,
    ) -> Result<SyncPoint<A>, ExecuteError> {
        profiling::scope!("CommandListManager::execute_command_lists");
        for list in lists.iter() {
            if !list.is_closed() {
                return Err(ExecuteError::NotClosed(list.id()));
            }
            if self.ty != QueueType::Direct && list.ty() != self.ty {
                return Err(ExecuteError::WrongQueue {
                    list: list.ty(),
                    queue: self.ty,
                });
            }
        }
        if lists.is_empty() {
            return Ok(SyncPoint::new(
                Arc::clone(&self.fence),
                self.fence.last_signaled(),
            ));
        }

        let mut pool = self.pool.lock();
        let mut lists = lists.into_iter().peekable();
        let mut last = None;
        while lists.peek().is_some() {
            let batch: Vec<_> = lists.by_ref().take(self.max_per_batch).collect();
            let sync_point = self.execute_batch(device, &mut pool, batch)?;
            last = Some(sync_point);
        }
        last.ok_or(ExecuteError::Device(DeviceError::Unexpected))
    }

    fn execute_batch(
        &self,
        device: &A::Device,
        pool: &mut PoolState<A>,
        mut batch: Vec<CommandList<A>>,
    ) -> Result<SyncPoint<A>, ExecuteError> {
        let mut barrier_allocator = None;
        let mut barrier_lists: SmallVec<[Option<CommandList<A>>; 8]> = SmallVec::new();
        for list in batch.iter_mut() {
            let mut barriers = BarrierBatcher::new();
            list.tracker_mut().resolve(&mut barriers);
            if barriers.is_empty() {
                barrier_lists.push(None);
                continue;
            }
            let allocator = match barrier_allocator {
                Some(ref mut allocator) => allocator,
                None => barrier_allocator.insert(pool.allocators.obtain(device)?),
            };
            let reused = pool.free_lists.pop();
            let mut barrier_list = Self::prepare_list(device, self.ty, reused, allocator)?;
            barriers.flush(barrier_list.raw_mut());
            barrier_list.close()?;
            barrier_lists.push(Some(barrier_list));
        }

        {
            let mut raw: Vec<&A::CommandList> = Vec::with_capacity(batch.len() * 2);
            for (barrier_list, list) in barrier_lists.iter().zip(batch.iter()) {
                if let Some(barrier_list) = barrier_list {
                    raw.push(barrier_list.raw());
                }
                raw.push(list.raw());
            }
            self.queue.submit(&raw).map_err(DeviceError::from)?;
        }
        let value = self.fence.signal(&self.queue)?;
        let sync_point = SyncPoint::new(Arc::clone(&self.fence), value);
        api_log!(
            "Executed {} {:?} command lists up to {sync_point:?}",
            batch.len(),
            self.ty
        );

        let barrier_count = barrier_lists.iter().flatten().count();
        self.command_lists
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.barrier_lists
            .fetch_add(barrier_count as u64, Ordering::Relaxed);
        self.submissions.fetch_add(1, Ordering::Relaxed);

        for list in batch.into_iter().chain(barrier_lists.into_iter().flatten()) {
            list.sync_point().resolve(sync_point.clone());
            pool.free_lists.push(list);
        }
        if let Some(allocator) = barrier_allocator {
            pool.allocators.release(allocator);
        }
        Ok(sync_point)
    }

    pub fn is_complete(&self, value: FenceValue) -> bool {
        self.fence.is_complete(value)
    }

    pub fn wait_for_completion(&self, value: FenceValue) -> Result<(), DeviceError> {
        self.fence.wait_for_completion(value)
    }

    /// Signals the fence and blocks until the queue has finished all work
    /// submitted so far.
    pub fn flush(&self) -> Result<SyncPoint<A>, DeviceError> {
        let value = self.fence.signal(&self.queue)?;
        self.fence.wait_for_completion(value)?;
        Ok(SyncPoint::new(Arc::clone(&self.fence), value))
    }

    /// Makes this queue wait on the GPU for `sync_point`.
    pub fn gpu_wait(&self, sync_point: &SyncPoint<A>) -> Result<(), DeviceError> {
        sync_point.gpu_wait(&self.queue)
    }

    pub fn stats(&self) -> ExecuteStats {
        ExecuteStats {
            command_lists: self.command_lists.load(Ordering::Relaxed),
            barrier_lists: self.barrier_lists.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
        }
    }
}

impl<A: HalApi> fmt::Debug for CommandListManager<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandListManager")
            .field("ty", &self.ty)
            .field("fence", &self.fence)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::Resource;
    use hal::{
        api::Soft,
        soft::{self, ExecutionMode},
        Device as _, HeapKind, ResourceDescriptor, ResourceStates,
    };

    fn manager(
        device: &soft::Device,
        max_per_batch: usize,
    ) -> CommandListManager<Soft> {
        let settings = Settings {
            max_command_lists_per_batch: max_per_batch,
            ..Default::default()
        };
        CommandListManager::new(device, QueueType::Direct, &settings).unwrap()
    }

    #[test]
    fn batches_share_one_signal() {
        let device = soft::Device::new(ExecutionMode::Manual);
        let manager = manager(&device, 2);
        let mut allocator = manager.obtain_allocator(&device).unwrap();
        let lists: Vec<_> = (0..3)
            .map(|_| {
                let mut list = manager.obtain_command_list(&device, &mut allocator).unwrap();
                list.close().unwrap();
                list
            })
            .collect();
        let pending: Vec<_> = lists.iter().map(|list| list.sync_point().clone()).collect();

        let sync_point = manager.execute_command_lists(&device, lists).unwrap();
        assert_eq!(sync_point.value(), 2);
        let values: Vec<_> = pending
            .iter()
            .map(|pending| pending.get().map(SyncPoint::value))
            .collect();
        assert_eq!(values, [Some(1), Some(1), Some(2)]);
        assert_eq!(manager.stats().submissions, 2);

        assert!(!allocator.is_ready());
        sync_point.wait_for_completion().unwrap();
        assert!(allocator.is_ready());
    }

    #[test]
    fn pending_transitions_get_a_barrier_list() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let manager = manager(&device, 64);
        let desc = ResourceDescriptor::buffer(Some("buffer"), 256, HeapKind::Default);
        let raw = device.create_resource(&desc).unwrap();
        let buffer = Arc::new(Resource::<Soft>::new(raw, &desc, 0));

        let mut allocator = manager.obtain_allocator(&device).unwrap();
        let mut first = manager.obtain_command_list(&device, &mut allocator).unwrap();
        first.transition_resource(&buffer, None, ResourceStates::COMMON);
        first.close().unwrap();
        let mut second = manager.obtain_command_list(&device, &mut allocator).unwrap();
        second.transition_resource(&buffer, None, ResourceStates::COPY_DEST);
        second.close().unwrap();

        manager
            .execute_command_lists(&device, vec![first, second])
            .unwrap();
        let stats = manager.stats();
        assert_eq!(stats.command_lists, 2);
        assert_eq!(stats.barrier_lists, 1);
        assert_eq!(buffer.uniform_state(), Some(ResourceStates::COPY_DEST));

        // The pool hands back executed lists.
        let reused = manager.obtain_command_list(&device, &mut allocator).unwrap();
        assert!(reused.raw().commands().is_empty());
        assert!(!reused.is_closed());
    }

    #[test]
    fn recording_lists_are_rejected() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let manager = manager(&device, 64);
        let mut allocator = manager.obtain_allocator(&device).unwrap();
        let list = manager.obtain_command_list(&device, &mut allocator).unwrap();
        let id = list.id();
        match manager.execute_command_lists(&device, vec![list]) {
            Err(ExecuteError::NotClosed(rejected)) => assert_eq!(rejected, id),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
