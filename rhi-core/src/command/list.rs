use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use hal::{CommandList as _, Device as _, QueueType, ResourceStates, SubresourceRange};

use super::{BarrierBatcher, CommandAllocator};
use crate::{
    api_log, device::DeviceError, fatal, fence::PendingSyncPoint, hal_api::HalApi,
    resource::Resource, track::CommandListTracker,
};

static NEXT_LIST_ID: AtomicU32 = AtomicU32::new(1);

/// A command list and everything it needs until it is executed.
///
/// Resource transitions go through the list's own tracker, so barriers whose
/// before state is unknown while recording are resolved at execution.
pub struct CommandList<A: HalApi> {
    raw: A::CommandList,
    id: u32,
    ty: QueueType,
    closed: bool,
    /// Resolved when the list is executed.
    sync_point: PendingSyncPoint<A>,
    /// Open-list counter of the allocator recording this list.
    allocator: Option<Arc<AtomicU32>>,
    barriers: BarrierBatcher<A>,
    tracker: CommandListTracker<A>,
}

impl<A: HalApi> CommandList<A> {
    pub(crate) fn new(
        device: &A::Device,
        ty: QueueType,
        allocator: &mut CommandAllocator<A>,
    ) -> Result<Self, DeviceError> {
        let id = NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed);
        let label = format!("{ty:?} command list {id}");
        let raw = device.create_command_list(ty, allocator.raw_mut(), Some(&label))?;
        let sync_point = PendingSyncPoint::new();
        let open = allocator.open_list(&sync_point);
        api_log!("Created {label}");
        Ok(Self {
            raw,
            id,
            ty,
            closed: false,
            sync_point,
            allocator: Some(open),
            barriers: BarrierBatcher::new(),
            tracker: CommandListTracker::new(),
        })
    }

    /// Starts recording a list that has been executed into `allocator`.
    pub(crate) fn reset(&mut self, allocator: &mut CommandAllocator<A>) -> Result<(), DeviceError> {
        if !self.closed {
            fatal!("Command list {} reset while recording", self.id);
        }
        self.raw.reset(allocator.raw_mut())?;
        self.closed = false;
        self.sync_point = PendingSyncPoint::new();
        self.allocator = Some(allocator.open_list(&self.sync_point));
        self.barriers = BarrierBatcher::new();
        self.tracker.clear();
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ty(&self) -> QueueType {
        self.ty
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The point the GPU will have passed once this list has executed.
    pub fn sync_point(&self) -> &PendingSyncPoint<A> {
        &self.sync_point
    }

    pub fn raw(&self) -> &A::CommandList {
        &self.raw
    }

    /// The raw list with all batched barriers recorded.
    pub fn raw_mut(&mut self) -> &mut A::CommandList {
        self.flush_barriers();
        &mut self.raw
    }

    pub fn tracker(&self) -> &CommandListTracker<A> {
        &self.tracker
    }

    pub(crate) fn tracker_mut(&mut self) -> &mut CommandListTracker<A> {
        &mut self.tracker
    }

    /// Transitions `range` of `resource` (all of it when `None`) to `after`.
    pub fn transition_resource(
        &mut self,
        resource: &Arc<Resource<A>>,
        range: Option<&SubresourceRange>,
        after: ResourceStates,
    ) {
        self.assert_recording();
        self.tracker
            .transition(resource, range, after, &mut self.barriers);
    }

    pub fn uav_barrier(&mut self, resource: &Arc<Resource<A>>) {
        self.assert_recording();
        self.tracker.uav_barrier(resource, &mut self.barriers);
    }

    pub fn flush_barriers(&mut self) -> usize {
        self.barriers.flush(&mut self.raw)
    }

    pub fn close(&mut self) -> Result<(), DeviceError> {
        self.assert_recording();
        self.flush_barriers();
        self.closed = true;
        if let Some(open) = self.allocator.take() {
            open.fetch_sub(1, Ordering::AcqRel);
        }
        self.raw.close()?;
        Ok(())
    }

    fn assert_recording(&self) {
        if self.closed {
            fatal!("Command list {} used after it was closed", self.id);
        }
    }
}

impl<A: HalApi> Drop for CommandList<A> {
    fn drop(&mut self) {
        if let Some(open) = self.allocator.take() {
            open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<A: HalApi> fmt::Debug for CommandList<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.id)
            .field("ty", &self.ty)
            .field("closed", &self.closed)
            .field("sync_point", &self.sync_point)
            .field("tracker", &self.tracker)
            .finish()
    }
}
