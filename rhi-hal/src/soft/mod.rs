/*! Software backend.
 *
 * Nothing is rendered. Command lists keep a log of what was recorded,
 * descriptor heaps keep what was written into them, and queue work runs on a
 * simulated GPU timeline. Execution order, fence signals, cross-queue waits
 * and the lifetime rules of command allocators behave like a real device,
 * which makes the backend suitable for exercising the tracking logic above
 * the hal.
!*/

mod command;
mod descriptor;
mod gpu;

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

pub use command::{BarrierRecord, Command, CommandAllocator, CommandList};
pub use descriptor::{DescriptorContents, DescriptorHeap};
pub use gpu::ExecutionMode;

use crate::{
    BindPoint, CpuDescriptor, DescriptorHeapType, DeviceError, FenceValue, GpuDescriptor,
    QueueType, ResourceDescriptor, ResourceDimension, RootParameter, ViewDescriptor,
};
use descriptor::HeapRegistry;
use gpu::{FenceShared, Gpu, QueueOp};

#[derive(Clone, Debug)]
pub struct Api;

impl crate::Api for Api {
    type Device = Device;
    type Queue = Queue;
    type Fence = Fence;
    type CommandAllocator = CommandAllocator;
    type CommandList = CommandList;
    type DescriptorHeap = DescriptorHeap;
    type RootSignature = RootSignature;
    type PipelineState = PipelineState;
    type Resource = Resource;
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Counts of driver objects created through a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub command_allocators: u32,
    pub allocator_resets: u32,
    pub command_lists: u32,
    pub descriptor_heaps: u32,
    pub root_signatures: u32,
    pub pipelines: u32,
    pub resources: u32,
    pub submissions: u32,
}

#[derive(Debug, Default)]
struct StatCounters {
    command_allocators: AtomicU32,
    allocator_resets: AtomicU32,
    command_lists: AtomicU32,
    descriptor_heaps: AtomicU32,
    root_signatures: AtomicU32,
    pipelines: AtomicU32,
    resources: AtomicU32,
    submissions: AtomicU32,
}

fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug)]
pub struct Device {
    gpu: Arc<Gpu>,
    heaps: HeapRegistry,
    stats: Arc<StatCounters>,
}

impl Device {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            gpu: Arc::new(Gpu::new(mode)),
            heaps: HeapRegistry::default(),
            stats: Arc::default(),
        }
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        self.gpu.set_mode(mode);
    }

    /// Runs all queued GPU work that can make progress. Returns the number of
    /// operations executed.
    pub fn run_gpu(&self) -> usize {
        self.gpu.run()
    }

    /// Runs at most one queued GPU operation.
    pub fn step_gpu(&self) -> bool {
        self.gpu.step()
    }

    /// Number of queued GPU operations not executed yet.
    pub fn pending_gpu_work(&self) -> usize {
        self.gpu.pending()
    }

    /// Simulates device removal. Queued work is dropped.
    pub fn lose(&self) {
        log::warn!("Soft device lost");
        self.gpu.lose();
    }

    pub fn stats(&self) -> Stats {
        let load = |counter: &AtomicU32| counter.load(Ordering::Relaxed);
        let c = &self.stats;
        Stats {
            command_allocators: load(&c.command_allocators),
            allocator_resets: load(&c.allocator_resets),
            command_lists: load(&c.command_lists),
            descriptor_heaps: load(&c.descriptor_heaps),
            root_signatures: load(&c.root_signatures),
            pipelines: load(&c.pipelines),
            resources: load(&c.resources),
            submissions: load(&c.submissions),
        }
    }

    /// Reads back the descriptor stored at `handle`.
    pub fn read_descriptor(&self, handle: CpuDescriptor) -> Option<DescriptorContents> {
        let (heap, index) = self.heaps.resolve(handle.ptr)?;
        let slots = heap.slots.lock();
        slots.get(index as usize).cloned()
    }

    /// Reads back the descriptor a shader would see at `handle`.
    pub fn read_gpu_descriptor(&self, handle: GpuDescriptor) -> Option<DescriptorContents> {
        let (heap, index) = self.heaps.resolve(handle.ptr)?;
        if !heap.shader_visible {
            return None;
        }
        let slots = heap.slots.lock();
        slots.get(index as usize).cloned()
    }
}

impl crate::Device for Device {
    type A = Api;

    fn create_queue(&self, ty: QueueType) -> Result<Queue, DeviceError> {
        self.gpu.check_lost()?;
        Ok(Queue {
            ty,
            index: self.gpu.add_queue(),
            gpu: Arc::clone(&self.gpu),
            stats: Arc::clone(&self.stats),
        })
    }

    fn create_fence(&self) -> Result<Fence, DeviceError> {
        self.gpu.check_lost()?;
        Ok(Fence {
            shared: Arc::default(),
            gpu: Arc::clone(&self.gpu),
        })
    }

    fn create_command_allocator(&self, ty: QueueType) -> Result<CommandAllocator, DeviceError> {
        self.gpu.check_lost()?;
        bump(&self.stats.command_allocators);
        Ok(CommandAllocator {
            ty,
            in_flight: Arc::default(),
            resets: 0,
        })
    }

    fn reset_command_allocator(&self, allocator: &mut CommandAllocator) -> Result<(), DeviceError> {
        self.gpu.check_lost()?;
        let in_flight = allocator.in_flight();
        if in_flight != 0 {
            log::error!(
                "Command allocator reset while {in_flight} command list(s) recorded into it are executing"
            );
            return Err(DeviceError::Unexpected);
        }
        allocator.resets += 1;
        bump(&self.stats.allocator_resets);
        Ok(())
    }

    fn create_command_list(
        &self,
        ty: QueueType,
        allocator: &mut CommandAllocator,
        label: crate::Label,
    ) -> Result<CommandList, DeviceError> {
        self.gpu.check_lost()?;
        if allocator.ty != ty {
            log::error!(
                "Command list of type {ty:?} created with an allocator of type {:?}",
                allocator.ty
            );
            return Err(DeviceError::Unexpected);
        }
        bump(&self.stats.command_lists);
        Ok(CommandList {
            ty,
            label: label.map(str::to_string),
            allocator: Arc::clone(&allocator.in_flight),
            recording: true,
            commands: Vec::new(),
        })
    }

    fn create_descriptor_heap(
        &self,
        desc: &crate::DescriptorHeapDescriptor,
    ) -> Result<DescriptorHeap, DeviceError> {
        self.gpu.check_lost()?;
        if desc.shader_visible && !desc.ty.can_be_shader_visible() {
            log::error!("{:?} heaps cannot be shader visible", desc.ty);
            return Err(DeviceError::ResourceCreationFailed);
        }
        if desc.count == 0 {
            return Err(DeviceError::ResourceCreationFailed);
        }
        bump(&self.stats.descriptor_heaps);
        Ok(DescriptorHeap {
            storage: self.heaps.create(desc.ty, desc.count, desc.shader_visible),
        })
    }

    fn descriptor_increment(&self, ty: DescriptorHeapType) -> u32 {
        descriptor::increment(ty)
    }

    fn heap_cpu_start(&self, heap: &DescriptorHeap) -> CpuDescriptor {
        heap.storage.cpu_start()
    }

    fn heap_gpu_start(&self, heap: &DescriptorHeap) -> GpuDescriptor {
        if !heap.storage.shader_visible {
            log::warn!("GPU handle requested for non shader-visible heap {}", heap.id());
        }
        heap.storage.gpu_start()
    }

    fn write_descriptor(&self, dst: CpuDescriptor, view: &ViewDescriptor<'_, Api>) {
        let Some((heap, index)) = self.heaps.resolve(dst.ptr) else {
            log::error!("Descriptor write to invalid handle {:#x}", dst.ptr);
            panic!("invalid descriptor handle");
        };
        if heap.ty != view.kind().heap_type() {
            log::error!("{:?} written into a {:?} heap", view.kind(), heap.ty);
            panic!("descriptor heap type mismatch");
        }
        let mut slots = heap.slots.lock();
        match slots.get_mut(index as usize) {
            Some(slot) => *slot = DescriptorContents::from_view(view),
            None => {
                log::error!("Descriptor write past the end of heap {}", heap.id);
                panic!("descriptor handle out of range");
            }
        }
    }

    fn copy_descriptors(&self, dst: CpuDescriptor, srcs: &[CpuDescriptor], ty: DescriptorHeapType) {
        if srcs.is_empty() {
            return;
        }
        let contents: Vec<_> = srcs
            .iter()
            .map(|src| match self.heaps.resolve(src.ptr) {
                Some((heap, index)) if heap.ty == ty => heap.slots.lock()[index as usize].clone(),
                _ => {
                    log::error!("Descriptor copy from invalid handle {:#x}", src.ptr);
                    panic!("invalid descriptor handle");
                }
            })
            .collect();
        let Some((heap, base)) = self.heaps.resolve(dst.ptr) else {
            log::error!("Descriptor copy to invalid handle {:#x}", dst.ptr);
            panic!("invalid descriptor handle");
        };
        let mut slots = heap.slots.lock();
        let base = base as usize;
        if heap.ty != ty || base + contents.len() > slots.len() {
            log::error!(
                "Descriptor copy of {} {ty:?} descriptors out of range of heap {}",
                contents.len(),
                heap.id
            );
            panic!("descriptor copy out of range");
        }
        for (slot, value) in slots[base..].iter_mut().zip(contents) {
            *slot = value;
        }
    }

    fn create_root_signature(
        &self,
        desc: &crate::RootSignatureDescriptor,
    ) -> Result<RootSignature, DeviceError> {
        self.gpu.check_lost()?;
        let cost = desc.parameters.len() as u32 * RootParameter::COST;
        if cost > crate::MAX_ROOT_COST {
            log::error!(
                "Root signature {:?} costs {cost} values, more than {}",
                desc.label,
                crate::MAX_ROOT_COST
            );
            return Err(DeviceError::ResourceCreationFailed);
        }
        bump(&self.stats.root_signatures);
        Ok(RootSignature {
            id: next_id(),
            parameters: desc.parameters.to_vec(),
        })
    }

    fn create_graphics_pipeline(
        &self,
        desc: &crate::GraphicsPipelineDescriptor<'_, Api>,
    ) -> Result<PipelineState, DeviceError> {
        self.gpu.check_lost()?;
        if desc.vertex.is_empty() || desc.render_target_formats.len() > crate::MAX_RENDER_TARGETS
        {
            return Err(DeviceError::ResourceCreationFailed);
        }
        bump(&self.stats.pipelines);
        Ok(PipelineState {
            id: next_id(),
            bind_point: BindPoint::Graphics,
            root_signature: desc.root_signature.id,
        })
    }

    fn create_compute_pipeline(
        &self,
        desc: &crate::ComputePipelineDescriptor<'_, Api>,
    ) -> Result<PipelineState, DeviceError> {
        self.gpu.check_lost()?;
        if desc.shader.is_empty() {
            return Err(DeviceError::ResourceCreationFailed);
        }
        bump(&self.stats.pipelines);
        Ok(PipelineState {
            id: next_id(),
            bind_point: BindPoint::Compute,
            root_signature: desc.root_signature.id,
        })
    }

    fn create_resource(&self, desc: &ResourceDescriptor) -> Result<Resource, DeviceError> {
        self.gpu.check_lost()?;
        if desc.width == 0 {
            return Err(DeviceError::ResourceCreationFailed);
        }
        if desc.dimension != ResourceDimension::Buffer
            && (desc.width > u64::from(crate::MAX_TEXTURE_DIMENSION_2D)
                || desc.height > crate::MAX_TEXTURE_DIMENSION_2D)
        {
            return Err(DeviceError::ResourceCreationFailed);
        }
        bump(&self.stats.resources);
        let id = next_id();
        Ok(Resource {
            id,
            dimension: desc.dimension,
            size: desc.width,
            subresource_count: desc.subresource_count(),
            // Every resource gets its own 4GiB window.
            gpu_address: id << 32,
        })
    }

    fn resource_gpu_address(&self, resource: &Resource) -> u64 {
        resource.gpu_address
    }
}

#[derive(Debug)]
pub struct Queue {
    ty: QueueType,
    index: usize,
    gpu: Arc<Gpu>,
    stats: Arc<StatCounters>,
}

impl crate::Queue for Queue {
    type A = Api;

    fn queue_type(&self) -> QueueType {
        self.ty
    }

    fn submit(&self, lists: &[&CommandList]) -> Result<(), DeviceError> {
        self.gpu.check_lost()?;
        if let Some(open) = lists.iter().find(|list| list.recording) {
            log::error!("Submitted command list {:?} is still recording", open.label);
            return Err(DeviceError::Unexpected);
        }
        if let Some(list) = lists
            .iter()
            .find(|list| self.ty != QueueType::Direct && list.ty != self.ty)
        {
            log::error!(
                "{:?} command list {:?} submitted to a {:?} queue",
                list.ty,
                list.label,
                self.ty
            );
            return Err(DeviceError::Unexpected);
        }
        bump(&self.stats.submissions);
        let ops: Vec<_> = lists
            .iter()
            .map(|list| {
                list.allocator.fetch_add(1, Ordering::AcqRel);
                QueueOp::Execute(Arc::clone(&list.allocator))
            })
            .collect();
        self.gpu.enqueue(self.index, ops);
        Ok(())
    }

    fn signal(&self, fence: &Fence, value: FenceValue) -> Result<(), DeviceError> {
        self.gpu.check_lost()?;
        self.gpu.enqueue(
            self.index,
            Some(QueueOp::Signal(Arc::clone(&fence.shared), value)),
        );
        Ok(())
    }

    fn wait(&self, fence: &Fence, value: FenceValue) -> Result<(), DeviceError> {
        self.gpu.check_lost()?;
        self.gpu
            .enqueue(self.index, Some(QueueOp::Wait(Arc::clone(&fence.shared), value)));
        Ok(())
    }
}

#[derive(Debug)]
pub struct Fence {
    shared: Arc<FenceShared>,
    gpu: Arc<Gpu>,
}

impl crate::Fence for Fence {
    fn completed_value(&self) -> Result<FenceValue, DeviceError> {
        self.gpu.check_lost()?;
        Ok(self.shared.value.load(Ordering::Acquire))
    }

    fn wait(&self, value: FenceValue, timeout_ms: u32) -> Result<bool, DeviceError> {
        self.gpu.wait(&self.shared, value, timeout_ms)
    }
}

#[derive(Debug)]
pub struct RootSignature {
    id: u64,
    parameters: Vec<RootParameter>,
}

impl RootSignature {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parameters(&self) -> &[RootParameter] {
        &self.parameters
    }
}

#[derive(Debug)]
pub struct PipelineState {
    id: u64,
    bind_point: BindPoint,
    root_signature: u64,
}

impl PipelineState {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bind_point(&self) -> BindPoint {
        self.bind_point
    }

    pub fn root_signature(&self) -> u64 {
        self.root_signature
    }
}

#[derive(Debug)]
pub struct Resource {
    id: u64,
    dimension: ResourceDimension,
    size: u64,
    subresource_count: u32,
    gpu_address: u64,
}

impl Resource {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dimension(&self) -> ResourceDimension {
        self.dimension
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn subresource_count(&self) -> u32 {
        self.subresource_count
    }
}
