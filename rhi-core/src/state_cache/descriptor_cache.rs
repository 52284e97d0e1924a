use std::sync::Arc;

use arrayvec::ArrayVec;
use hal::{
    CommandList as _, CpuDescriptor, DescriptorHeapType, Device as _, GpuDescriptor, MAX_SAMPLERS,
};

use crate::{
    config::ViewHeapMode,
    descriptor::{
        GlobalSamplerTableCache, OnlineHeap, SubAllocatedOnlineHeap, ThreadLocalOnlineHeap,
        UniqueSamplerTable,
    },
    device::{Device, DeviceError},
    fence::PendingSyncPoint,
    hal_api::HalApi,
    resource::{Sampler, TrackerId},
};

/// The online heaps one context copies descriptor tables into.
///
/// View tables go into the context's view heap: a block of the global view
/// heap, or a local ring once the global heap runs out of blocks. Sampler
/// tables are looked up in the device's global sampler table cache first.
/// After the first miss on a command list, that list copies all of its
/// sampler tables into the local sampler heap, and the tables it copied are
/// consolidated into the global cache when the list closes.
pub struct DescriptorCache<A: HalApi> {
    view_heap: Box<dyn OnlineHeap<A>>,
    local_samplers: ThreadLocalOnlineHeap<A>,
    global_samplers: Option<Arc<GlobalSamplerTableCache<A>>>,
    use_global_samplers: bool,
    unique_sampler_tables: Vec<UniqueSamplerTable<A>>,
    current_list: PendingSyncPoint<A>,
    local_view_heap_size: u32,
    rollovers: u32,
}

impl<A: HalApi> DescriptorCache<A> {
    pub(crate) fn new(device: &Device<A>) -> Result<Self, DeviceError> {
        let settings = device.settings();
        let view_heap: Box<dyn OnlineHeap<A>> = match settings.view_heap_mode {
            ViewHeapMode::SubAllocated => Box::new(SubAllocatedOnlineHeap::new(Arc::clone(
                device.global_view_heap(),
            ))),
            ViewHeapMode::ThreadLocal => Box::new(ThreadLocalOnlineHeap::new(
                device.raw(),
                "context views",
                DescriptorHeapType::CbvSrvUav,
                settings.local_view_heap_size,
            )?),
        };
        let local_samplers = ThreadLocalOnlineHeap::new(
            device.raw(),
            "context samplers",
            DescriptorHeapType::Sampler,
            settings.local_sampler_heap_size,
        )?;
        let global_samplers = settings
            .sampler_table_cache
            .then(|| Arc::clone(device.sampler_table_cache()));
        Ok(Self {
            view_heap,
            local_samplers,
            use_global_samplers: global_samplers.is_some(),
            global_samplers,
            unique_sampler_tables: Vec::new(),
            current_list: PendingSyncPoint::new(),
            local_view_heap_size: settings.local_view_heap_size,
            rollovers: 0,
        })
    }

    pub fn view_heap(&self) -> &dyn OnlineHeap<A> {
        &*self.view_heap
    }

    /// True while sampler tables come from the global cache.
    pub fn uses_global_samplers(&self) -> bool {
        self.use_global_samplers
    }

    /// Number of rollovers of either heap so far.
    pub fn rollover_count(&self) -> u32 {
        self.rollovers
    }

    pub(crate) fn bind_heaps(&self, list: &mut A::CommandList) {
        let sampler_heap = match self.global_samplers {
            Some(ref cache) if self.use_global_samplers => cache.heap().raw(),
            _ => self.local_samplers.heap(),
        };
        list.set_descriptor_heaps(self.view_heap.heap(), sampler_heap);
    }

    pub(crate) fn find_global_sampler_table(&self, key: &[TrackerId]) -> Option<GpuDescriptor> {
        match self.global_samplers {
            Some(ref cache) if self.use_global_samplers => cache.find(key),
            _ => None,
        }
    }

    /// Switches the rest of the current command list to the local sampler
    /// heap. Every bound table must be rebound afterwards.
    pub(crate) fn switch_to_local_samplers(&mut self) {
        log::debug!("Sampler table cache miss, using the local sampler heap");
        self.use_global_samplers = false;
    }

    /// Whether `views` and `samplers` slots fit in the heaps.
    pub(crate) fn can_reserve(&self, views: u32, samplers: u32) -> (bool, bool) {
        (
            views == 0 || self.view_heap.can_reserve_slots(views),
            samplers == 0 || self.local_samplers.can_reserve_slots(samplers),
        )
    }

    pub(crate) fn roll_over(
        &mut self,
        device: &Device<A>,
        views: bool,
        samplers: bool,
    ) -> Result<(), DeviceError> {
        self.rollovers += 1;
        if views && !self.view_heap.roll_over(device.raw())? {
            log::warn!(
                "Falling back to a local view heap of {} descriptors",
                self.local_view_heap_size
            );
            let mut local = ThreadLocalOnlineHeap::new(
                device.raw(),
                "context views",
                DescriptorHeapType::CbvSrvUav,
                self.local_view_heap_size,
            )?;
            local.set_current_command_list(&self.current_list);
            self.view_heap = Box::new(local);
        }
        if samplers {
            self.local_samplers.roll_over(device.raw())?;
        }
        Ok(())
    }

    /// Reserves both ranges. [`DescriptorCache::can_reserve`] must allow it.
    pub(crate) fn reserve(&mut self, views: u32, samplers: u32) -> (u32, u32) {
        let view_base = match views {
            0 => 0,
            n => self.view_heap.reserve_slots(n),
        };
        let sampler_base = match samplers {
            0 => 0,
            n => self.local_samplers.reserve_slots(n),
        };
        (view_base, sampler_base)
    }

    /// Copies `sources` into the view heap at `slot`.
    pub(crate) fn write_view_table(
        &self,
        device: &A::Device,
        slot: u32,
        sources: &[CpuDescriptor],
    ) -> GpuDescriptor {
        device.copy_descriptors(
            self.view_heap.cpu_slot_handle(slot),
            sources,
            DescriptorHeapType::CbvSrvUav,
        );
        self.view_heap.gpu_slot_handle(slot)
    }

    /// Copies `samplers` into the local sampler heap at `slot`, remembering
    /// the table for consolidation.
    pub(crate) fn write_sampler_table(
        &mut self,
        device: &A::Device,
        slot: u32,
        samplers: ArrayVec<Arc<Sampler<A>>, MAX_SAMPLERS>,
    ) -> GpuDescriptor {
        let sources: ArrayVec<_, MAX_SAMPLERS> =
            samplers.iter().map(|sampler| sampler.descriptor()).collect();
        device.copy_descriptors(
            self.local_samplers.cpu_slot_handle(slot),
            &sources,
            DescriptorHeapType::Sampler,
        );
        if self.global_samplers.is_some() {
            let table = UniqueSamplerTable::new(samplers);
            let key = table.key();
            if !self
                .unique_sampler_tables
                .iter()
                .any(|known| known.key() == key)
            {
                self.unique_sampler_tables.push(table);
            }
        }
        self.local_samplers.gpu_slot_handle(slot)
    }

    /// Starts the heap regions of a new command list.
    pub(crate) fn set_current_command_list(&mut self, sync_point: &PendingSyncPoint<A>) {
        self.view_heap.set_current_command_list(sync_point);
        self.local_samplers.set_current_command_list(sync_point);
        self.current_list = sync_point.clone();
        self.use_global_samplers = self.global_samplers.is_some();
    }

    /// Sampler tables copied locally since the last call.
    pub(crate) fn take_unique_sampler_tables(&mut self) -> Vec<UniqueSamplerTable<A>> {
        std::mem::take(&mut self.unique_sampler_tables)
    }
}
