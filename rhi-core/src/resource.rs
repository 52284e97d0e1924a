use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use hal::{
    CpuDescriptor, Format, HeapKind, ResourceDescriptor, ResourceDimension, ResourceStates,
    SamplerDescriptor, SubresourceRange, ViewKind,
};
use parking_lot::{Mutex, MutexGuard};

use crate::{descriptor::OfflineDescriptor, hal_api::HalApi, resource_log, track::SubresourceStates};

/// Unique identity of a resource, view or sampler for the lifetime of the
/// process. Ids are never reused.
pub type TrackerId = u64;

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_tracker_id() -> TrackerId {
    NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed)
}

enum StateStorage {
    /// Resources in CPU-visible heaps never leave their state.
    Fixed(ResourceStates),
    Tracked(Mutex<SubresourceStates<ResourceStates>>),
}

/// A buffer or texture.
pub struct Resource<A: HalApi> {
    raw: A::Resource,
    id: TrackerId,
    label: String,
    desc: ResourceDescriptor<'static>,
    gpu_address: u64,
    state: StateStorage,
}

impl<A: HalApi> Resource<A> {
    pub(crate) fn new(raw: A::Resource, desc: &ResourceDescriptor, gpu_address: u64) -> Self {
        let id = next_tracker_id();
        let label = desc.label.unwrap_or_default().to_string();
        let state = match desc.heap.fixed_state() {
            Some(state) => StateStorage::Fixed(state),
            None => StateStorage::Tracked(Mutex::new(SubresourceStates::new(
                desc.subresource_count(),
                desc.initial_state,
            ))),
        };
        resource_log!("Created resource {id} {label:?} in {:?}", desc.initial_state);
        Self {
            raw,
            id,
            label,
            desc: ResourceDescriptor {
                label: None,
                dimension: desc.dimension,
                width: desc.width,
                height: desc.height,
                depth_or_array_size: desc.depth_or_array_size,
                mip_levels: desc.mip_levels,
                format: desc.format,
                heap: desc.heap,
                initial_state: desc.initial_state,
            },
            gpu_address,
            state,
        }
    }

    pub fn raw(&self) -> &A::Resource {
        &self.raw
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn desc(&self) -> &ResourceDescriptor<'static> {
        &self.desc
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn is_buffer(&self) -> bool {
        self.desc.dimension == ResourceDimension::Buffer
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.desc.format.is_depth_stencil()
    }

    pub fn subresource_count(&self) -> u32 {
        self.desc.subresource_count()
    }

    pub fn mip_level_count(&self) -> u32 {
        self.desc.mip_level_count()
    }

    /// Width and height of `mip`, never smaller than one texel.
    pub fn mip_extent(&self, mip: u32) -> (u32, u32) {
        let width = u32::try_from(self.desc.width).unwrap_or(u32::MAX);
        ((width >> mip).max(1), (self.desc.height >> mip).max(1))
    }

    /// Resources whose state can never change opt out of tracking.
    pub fn requires_tracking(&self) -> bool {
        matches!(self.state, StateStorage::Tracked(_))
    }

    pub fn heap(&self) -> HeapKind {
        self.desc.heap
    }

    /// The state of `subresource` once all executed work has finished.
    pub fn state(&self, subresource: u32) -> ResourceStates {
        match self.state {
            StateStorage::Fixed(state) => state,
            StateStorage::Tracked(ref states) => states.lock().get(subresource),
        }
    }

    /// The state shared by all subresources, if they agree.
    pub fn uniform_state(&self) -> Option<ResourceStates> {
        match self.state {
            StateStorage::Fixed(state) => Some(state),
            StateStorage::Tracked(ref states) => states.lock().uniform(),
        }
    }

    pub(crate) fn tracked_states(&self) -> Option<MutexGuard<'_, SubresourceStates<ResourceStates>>> {
        match self.state {
            StateStorage::Fixed(_) => None,
            StateStorage::Tracked(ref states) => Some(states.lock()),
        }
    }
}

impl<A: HalApi> fmt::Debug for Resource<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("dimension", &self.desc.dimension)
            .finish()
    }
}

impl<A: HalApi> Drop for Resource<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw resource {} {:?}", self.id, self.label);
    }
}

/// A resource view backed by an offline descriptor.
pub struct View<A: HalApi> {
    id: TrackerId,
    kind: ViewKind,
    resource: Arc<Resource<A>>,
    range: SubresourceRange,
    format: Format,
    read_only: bool,
    descriptor: OfflineDescriptor<A>,
}

impl<A: HalApi> View<A> {
    pub(crate) fn new(
        kind: ViewKind,
        resource: Arc<Resource<A>>,
        range: SubresourceRange,
        format: Format,
        read_only: bool,
        descriptor: OfflineDescriptor<A>,
    ) -> Self {
        Self {
            id: next_tracker_id(),
            kind,
            resource,
            range,
            format,
            read_only,
            descriptor,
        }
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn resource(&self) -> &Arc<Resource<A>> {
        &self.resource
    }

    pub fn range(&self) -> &SubresourceRange {
        &self.range
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Read-only depth-stencil views only need `DEPTH_READ`.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn descriptor(&self) -> CpuDescriptor {
        self.descriptor.handle()
    }

    /// True when the view covers every subresource of its resource.
    pub fn is_whole_resource(&self) -> bool {
        self.range.mip_count * self.range.layer_count >= self.resource.subresource_count()
    }
}

impl<A: HalApi> fmt::Debug for View<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("resource", &self.resource.id)
            .field("range", &self.range)
            .finish()
    }
}

pub struct Sampler<A: HalApi> {
    id: TrackerId,
    desc: SamplerDescriptor,
    descriptor: OfflineDescriptor<A>,
}

impl<A: HalApi> Sampler<A> {
    pub(crate) fn new(desc: SamplerDescriptor, descriptor: OfflineDescriptor<A>) -> Self {
        Self {
            id: next_tracker_id(),
            desc,
            descriptor,
        }
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn desc(&self) -> &SamplerDescriptor {
        &self.desc
    }

    pub fn descriptor(&self) -> CpuDescriptor {
        self.descriptor.handle()
    }
}

impl<A: HalApi> fmt::Debug for Sampler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish()
    }
}
