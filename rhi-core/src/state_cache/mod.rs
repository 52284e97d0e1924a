/*! Deferred binding state of a command context.
 *
 * Setters only record what the caller asked for, comparing against what is
 * already set so that rebinding the same object is free. Nothing reaches the
 * command list until [`StateCache::apply_state`] runs before a draw or
 * dispatch. It then
 *
 * 1. resolves the pipeline state object from the bound shaders and
 *    fixed-function state, unless one was set explicitly,
 * 2. rebinds the root signature if the pipeline uses a different one, which
 *    invalidates every descriptor table,
 * 3. reserves online heap slots for all dirty tables at once, rolling the
 *    heaps over when they do not fit,
 * 4. copies the dirty tables into the reserved slots, using null
 *    descriptors for unbound slots,
 * 5. records the remaining dirty state.
 *
 * Bound resources are transitioned to the states their bindings need
 * before any of that is recorded.
!*/

mod descriptor_cache;

use std::{fmt, sync::Arc};

use arrayvec::ArrayVec;
use hal::{
    BindPoint, BlendState, CommandList as _, CpuDescriptor, DepthStencilState,
    DescriptorRangeType, Format, IndexBufferView, IndexFormat, PrimitiveTopology,
    RasterizerState, Rect, ResourceStates, ShaderStage, StreamOutView, VertexBufferView, ViewKind,
    Viewport, MAX_CBS, MAX_RENDER_TARGETS, MAX_SAMPLERS, MAX_SRVS, MAX_STREAM_OUT_TARGETS,
    MAX_UAVS, MAX_VERTEX_STREAMS,
};
use thiserror::Error;

use crate::{
    command::CommandList,
    device::{Device, DeviceError},
    fatal,
    hal_api::HalApi,
    pipeline::{
        ComputePipeline, CreatePipelineError, GraphicsPipeline, GraphicsPipelineDesc,
        RootSignature, Shader, VertexDeclaration,
    },
    resource::{Resource, Sampler, TrackerId, View},
};

pub use descriptor_cache::DescriptorCache;

const RANGE_TYPES: [DescriptorRangeType; 4] = [
    DescriptorRangeType::Srv,
    DescriptorRangeType::Cbv,
    DescriptorRangeType::Uav,
    DescriptorRangeType::Sampler,
];

bitflags::bitflags! {
    /// State that must be recorded again before the next draw or dispatch.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u32 {
        const GRAPHICS_PIPELINE = 1 << 0;
        const COMPUTE_PIPELINE = 1 << 1;
        const VERTEX_BUFFERS = 1 << 2;
        const INDEX_BUFFER = 1 << 3;
        const RENDER_TARGETS = 1 << 4;
        const VIEWPORTS = 1 << 5;
        const SCISSORS = 1 << 6;
        const PRIMITIVE_TOPOLOGY = 1 << 7;
        const BLEND_FACTOR = 1 << 8;
        const STENCIL_REF = 1 << 9;
        const STREAM_OUT = 1 << 10;
        const DESCRIPTOR_HEAPS = 1 << 11;

        /// Fixed-function state of the graphics pipeline.
        const GRAPHICS_STATE = Self::VERTEX_BUFFERS.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::RENDER_TARGETS.bits()
            | Self::VIEWPORTS.bits()
            | Self::SCISSORS.bits()
            | Self::PRIMITIVE_TOPOLOGY.bits()
            | Self::BLEND_FACTOR.bits()
            | Self::STENCIL_REF.bits()
            | Self::STREAM_OUT.bits();
    }
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ApplyStateError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Pipeline(#[from] CreatePipelineError),
}

/// Changed slots per descriptor range type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SlotMasks {
    srv: u64,
    cbv: u16,
    uav: u8,
    sampler: u16,
}

impl SlotMasks {
    const ALL: Self = Self {
        srv: !0,
        cbv: !0,
        uav: !0,
        sampler: !0,
    };

    fn set(&mut self, ty: DescriptorRangeType, slot: usize) {
        match ty {
            DescriptorRangeType::Srv => self.srv |= 1 << slot,
            DescriptorRangeType::Cbv => self.cbv |= 1 << slot,
            DescriptorRangeType::Uav => self.uav |= 1 << slot,
            DescriptorRangeType::Sampler => self.sampler |= 1 << slot,
        }
    }

    fn any(&self, ty: DescriptorRangeType) -> bool {
        match ty {
            DescriptorRangeType::Srv => self.srv != 0,
            DescriptorRangeType::Cbv => self.cbv != 0,
            DescriptorRangeType::Uav => self.uav != 0,
            DescriptorRangeType::Sampler => self.sampler != 0,
        }
    }

    fn clear(&mut self, ty: DescriptorRangeType) {
        match ty {
            DescriptorRangeType::Srv => self.srv = 0,
            DescriptorRangeType::Cbv => self.cbv = 0,
            DescriptorRangeType::Uav => self.uav = 0,
            DescriptorRangeType::Sampler => self.sampler = 0,
        }
    }
}

/// Descriptor bindings of one shader stage.
struct StageBindings<A: HalApi> {
    srvs: [Option<Arc<View<A>>>; MAX_SRVS],
    cbvs: [Option<Arc<View<A>>>; MAX_CBS],
    uavs: [Option<Arc<View<A>>>; MAX_UAVS],
    samplers: [Option<Arc<Sampler<A>>>; MAX_SAMPLERS],
    dirty: SlotMasks,
}

impl<A: HalApi> StageBindings<A> {
    fn new() -> Self {
        Self {
            srvs: std::array::from_fn(|_| None),
            cbvs: std::array::from_fn(|_| None),
            uavs: std::array::from_fn(|_| None),
            samplers: std::array::from_fn(|_| None),
            dirty: SlotMasks::ALL,
        }
    }

    fn views(&self, ty: DescriptorRangeType) -> &[Option<Arc<View<A>>>] {
        match ty {
            DescriptorRangeType::Srv => &self.srvs,
            DescriptorRangeType::Cbv => &self.cbvs,
            DescriptorRangeType::Uav => &self.uavs,
            DescriptorRangeType::Sampler => &[],
        }
    }

    fn views_mut(&mut self, ty: DescriptorRangeType) -> &mut [Option<Arc<View<A>>>] {
        match ty {
            DescriptorRangeType::Srv => &mut self.srvs,
            DescriptorRangeType::Cbv => &mut self.cbvs,
            DescriptorRangeType::Uav => &mut self.uavs,
            DescriptorRangeType::Sampler => &mut [],
        }
    }
}

fn view_kind(ty: DescriptorRangeType) -> ViewKind {
    match ty {
        DescriptorRangeType::Srv => ViewKind::ShaderResource,
        DescriptorRangeType::Cbv => ViewKind::ConstantBuffer,
        DescriptorRangeType::Uav => ViewKind::UnorderedAccess,
        DescriptorRangeType::Sampler => ViewKind::Sampler,
    }
}

fn same<T>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

struct BufferBinding<A: HalApi> {
    resource: Arc<Resource<A>>,
    offset: u64,
}

impl<A: HalApi> BufferBinding<A> {
    fn is(&self, resource: &Arc<Resource<A>>, offset: u64) -> bool {
        Arc::ptr_eq(&self.resource, resource) && self.offset == offset
    }

    fn address(&self) -> u64 {
        self.resource.gpu_address() + self.offset
    }

    fn size(&self) -> u64 {
        self.resource.desc().width.saturating_sub(self.offset)
    }
}

/// Pipeline-affecting state of the graphics bind point.
#[derive(Clone, Debug)]
struct GraphicsState {
    blend: BlendState,
    rasterizer: RasterizerState,
    depth_stencil: DepthStencilState,
    sample_mask: u32,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            blend: BlendState::default(),
            rasterizer: RasterizerState::default(),
            depth_stencil: DepthStencilState::default(),
            sample_mask: !0,
        }
    }
}

/// Binding state of one [`CommandContext`](crate::context::CommandContext).
pub struct StateCache<A: HalApi> {
    dirty: DirtyFlags,

    shaders: [Option<Arc<Shader>>; ShaderStage::COUNT],
    vertex_declaration: Option<Arc<VertexDeclaration>>,
    graphics: GraphicsState,
    graphics_pipeline: Option<Arc<GraphicsPipeline<A>>>,
    compute_pipeline: Option<Arc<ComputePipeline<A>>>,
    /// Set when the pipeline was given explicitly and no setter has changed
    /// its state since.
    explicit_graphics: bool,
    explicit_compute: bool,

    /// What the command list has bound, per bind point.
    bound_root_signatures: [Option<Arc<RootSignature<A>>>; 2],
    bound_pipeline: Option<TrackerId>,

    stages: [StageBindings<A>; ShaderStage::COUNT],
    vertex_buffers: [Option<(BufferBinding<A>, u32)>; MAX_VERTEX_STREAMS],
    index_buffer: Option<(BufferBinding<A>, IndexFormat)>,
    render_targets: ArrayVec<Arc<View<A>>, MAX_RENDER_TARGETS>,
    depth_stencil: Option<Arc<View<A>>>,
    viewport: Option<Viewport>,
    scissor: Option<Rect>,
    topology: Option<PrimitiveTopology>,
    blend_factor: [f32; 4],
    stencil_ref: u32,
    stream_out: ArrayVec<BufferBinding<A>, MAX_STREAM_OUT_TARGETS>,

    descriptors: DescriptorCache<A>,
}

impl<A: HalApi> StateCache<A> {
    pub(crate) fn new(device: &Device<A>) -> Result<Self, DeviceError> {
        Ok(Self {
            dirty: DirtyFlags::all(),
            shaders: Default::default(),
            vertex_declaration: None,
            graphics: GraphicsState::default(),
            graphics_pipeline: None,
            compute_pipeline: None,
            explicit_graphics: false,
            explicit_compute: false,
            bound_root_signatures: [None, None],
            bound_pipeline: None,
            stages: std::array::from_fn(|_| StageBindings::new()),
            vertex_buffers: std::array::from_fn(|_| None),
            index_buffer: None,
            render_targets: ArrayVec::new(),
            depth_stencil: None,
            viewport: None,
            scissor: None,
            topology: None,
            blend_factor: [1.0; 4],
            stencil_ref: 0,
            stream_out: ArrayVec::new(),
            descriptors: DescriptorCache::new(device)?,
        })
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    /// Whether the `ty` table of `stage` must be copied again.
    pub fn is_table_dirty(&self, stage: ShaderStage, ty: DescriptorRangeType) -> bool {
        self.stages[stage.index()].dirty.any(ty)
    }

    pub fn descriptor_cache(&self) -> &DescriptorCache<A> {
        &self.descriptors
    }

    pub(crate) fn descriptor_cache_mut(&mut self) -> &mut DescriptorCache<A> {
        &mut self.descriptors
    }

    pub fn graphics_pipeline(&self) -> Option<&Arc<GraphicsPipeline<A>>> {
        self.graphics_pipeline.as_ref()
    }

    pub fn compute_pipeline(&self) -> Option<&Arc<ComputePipeline<A>>> {
        self.compute_pipeline.as_ref()
    }

    pub fn viewport(&self) -> Option<&Viewport> {
        self.viewport.as_ref()
    }

    pub fn scissor_rect(&self) -> Option<&Rect> {
        self.scissor.as_ref()
    }

    pub fn primitive_topology(&self) -> Option<PrimitiveTopology> {
        self.topology
    }

    pub fn render_targets(&self) -> &[Arc<View<A>>] {
        &self.render_targets
    }

    pub fn depth_stencil(&self) -> Option<&Arc<View<A>>> {
        self.depth_stencil.as_ref()
    }

    // Shaders and pipelines

    pub fn set_shader(&mut self, stage: ShaderStage, shader: Option<&Arc<Shader>>) {
        let slot = &mut self.shaders[stage.index()];
        if same(slot.as_ref(), shader) {
            return;
        }
        *slot = shader.cloned();
        if stage == ShaderStage::Compute {
            self.explicit_compute = false;
            self.dirty |= DirtyFlags::COMPUTE_PIPELINE;
        } else {
            self.graphics_state_changed();
        }
    }

    pub fn set_vertex_declaration(&mut self, declaration: Option<&Arc<VertexDeclaration>>) {
        if same(self.vertex_declaration.as_ref(), declaration) {
            return;
        }
        self.vertex_declaration = declaration.cloned();
        self.graphics_state_changed();
    }

    pub fn set_blend_state(&mut self, state: &BlendState) {
        if self.graphics.blend != *state {
            self.graphics.blend = *state;
            self.graphics_state_changed();
        }
    }

    pub fn set_rasterizer_state(&mut self, state: &RasterizerState) {
        if self.graphics.rasterizer != *state {
            self.graphics.rasterizer = *state;
            self.graphics_state_changed();
        }
    }

    pub fn set_depth_stencil_state(&mut self, state: &DepthStencilState) {
        if self.graphics.depth_stencil != *state {
            self.graphics.depth_stencil = *state;
            self.graphics_state_changed();
        }
    }

    pub fn set_sample_mask(&mut self, mask: u32) {
        if self.graphics.sample_mask != mask {
            self.graphics.sample_mask = mask;
            self.graphics_state_changed();
        }
    }

    fn graphics_state_changed(&mut self) {
        self.explicit_graphics = false;
        self.dirty |= DirtyFlags::GRAPHICS_PIPELINE;
    }

    /// Binds `pipeline` as is, skipping the cache lookup until some
    /// pipeline state is changed through a setter.
    pub fn set_graphics_pipeline(&mut self, pipeline: &Arc<GraphicsPipeline<A>>) {
        if self.explicit_graphics && same(self.graphics_pipeline.as_ref(), Some(pipeline)) {
            return;
        }
        let desc = pipeline.desc();
        for stage in ShaderStage::GRAPHICS {
            self.shaders[stage.index()] = desc.shader(stage).cloned();
        }
        self.vertex_declaration = desc.vertex_declaration.clone();
        self.graphics = GraphicsState {
            blend: desc.blend,
            rasterizer: desc.rasterizer,
            depth_stencil: desc.depth_stencil,
            sample_mask: desc.sample_mask,
        };
        self.graphics_pipeline = Some(Arc::clone(pipeline));
        self.explicit_graphics = true;
        self.dirty |= DirtyFlags::GRAPHICS_PIPELINE;
    }

    pub fn set_compute_pipeline(&mut self, pipeline: &Arc<ComputePipeline<A>>) {
        if self.explicit_compute && same(self.compute_pipeline.as_ref(), Some(pipeline)) {
            return;
        }
        self.shaders[ShaderStage::Compute.index()] = Some(Arc::clone(pipeline.shader()));
        self.compute_pipeline = Some(Arc::clone(pipeline));
        self.explicit_compute = true;
        self.dirty |= DirtyFlags::COMPUTE_PIPELINE;
    }

    // Descriptor bindings

    pub fn set_shader_resource_view(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        view: Option<&Arc<View<A>>>,
    ) {
        self.set_view(stage, DescriptorRangeType::Srv, slot, view);
    }

    pub fn set_constant_buffer_view(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        view: Option<&Arc<View<A>>>,
    ) {
        self.set_view(stage, DescriptorRangeType::Cbv, slot, view);
    }

    pub fn set_unordered_access_view(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        view: Option<&Arc<View<A>>>,
    ) {
        self.set_view(stage, DescriptorRangeType::Uav, slot, view);
    }

    fn set_view(
        &mut self,
        stage: ShaderStage,
        ty: DescriptorRangeType,
        slot: usize,
        view: Option<&Arc<View<A>>>,
    ) {
        if let Some(view) = view {
            if view.kind() != view_kind(ty) {
                fatal!("{:?} view bound to a {ty:?} slot", view.kind());
            }
        }
        let bindings = &mut self.stages[stage.index()];
        let Some(current) = bindings.views_mut(ty).get_mut(slot) else {
            fatal!("{ty:?} slot {slot} of the {stage:?} stage is out of range");
        };
        if same(current.as_ref(), view) {
            return;
        }
        *current = view.cloned();
        bindings.dirty.set(ty, slot);
    }

    pub fn set_sampler(&mut self, stage: ShaderStage, slot: usize, sampler: Option<&Arc<Sampler<A>>>) {
        let bindings = &mut self.stages[stage.index()];
        let Some(current) = bindings.samplers.get_mut(slot) else {
            fatal!("Sampler slot {slot} of the {stage:?} stage is out of range");
        };
        if same(current.as_ref(), sampler) {
            return;
        }
        *current = sampler.cloned();
        bindings.dirty.set(DescriptorRangeType::Sampler, slot);
    }

    // Input assembly and output merger

    pub fn set_stream_source(
        &mut self,
        slot: usize,
        buffer: Option<&Arc<Resource<A>>>,
        offset: u64,
        stride: u32,
    ) {
        let Some(current) = self.vertex_buffers.get_mut(slot) else {
            fatal!("Vertex stream {slot} is out of range");
        };
        let unchanged = match (current.as_ref(), buffer) {
            (Some((binding, bound_stride)), Some(buffer)) => {
                binding.is(buffer, offset) && *bound_stride == stride
            }
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }
        *current = buffer.map(|resource| {
            let binding = BufferBinding {
                resource: Arc::clone(resource),
                offset,
            };
            (binding, stride)
        });
        self.dirty |= DirtyFlags::VERTEX_BUFFERS;
    }

    pub fn set_index_buffer(
        &mut self,
        buffer: Option<&Arc<Resource<A>>>,
        offset: u64,
        format: IndexFormat,
    ) {
        let unchanged = match (self.index_buffer.as_ref(), buffer) {
            (Some((binding, bound_format)), Some(buffer)) => {
                binding.is(buffer, offset) && *bound_format == format
            }
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }
        self.index_buffer = buffer.map(|resource| {
            let binding = BufferBinding {
                resource: Arc::clone(resource),
                offset,
            };
            (binding, format)
        });
        self.dirty |= DirtyFlags::INDEX_BUFFER;
    }

    /// Returns true if the bound targets changed.
    pub fn set_render_targets(
        &mut self,
        colors: &[Arc<View<A>>],
        depth_stencil: Option<&Arc<View<A>>>,
    ) -> bool {
        if colors.len() > MAX_RENDER_TARGETS {
            fatal!("{} render targets bound, the limit is {MAX_RENDER_TARGETS}", colors.len());
        }
        let unchanged = colors.len() == self.render_targets.len()
            && colors
                .iter()
                .zip(&self.render_targets)
                .all(|(new, old)| Arc::ptr_eq(new, old))
            && same(self.depth_stencil.as_ref(), depth_stencil);
        if unchanged {
            return false;
        }

        let formats = |targets: &[Arc<View<A>>], depth: Option<&Arc<View<A>>>| {
            let colors: ArrayVec<Format, MAX_RENDER_TARGETS> =
                targets.iter().map(|view| view.format()).collect();
            (colors, depth.map(|view| view.format()))
        };
        if formats(colors, depth_stencil)
            != formats(&self.render_targets, self.depth_stencil.as_ref())
        {
            self.dirty |= DirtyFlags::GRAPHICS_PIPELINE;
        }
        self.render_targets = colors.iter().cloned().collect();
        self.depth_stencil = depth_stencil.cloned();
        self.dirty |= DirtyFlags::RENDER_TARGETS;
        true
    }

    pub fn set_viewport(&mut self, viewport: &Viewport) {
        if self.viewport.as_ref() != Some(viewport) {
            self.viewport = Some(*viewport);
            self.dirty |= DirtyFlags::VIEWPORTS;
        }
    }

    pub fn set_scissor_rect(&mut self, rect: &Rect) {
        if self.scissor.as_ref() != Some(rect) {
            self.scissor = Some(*rect);
            self.dirty |= DirtyFlags::SCISSORS;
        }
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        if self.topology == Some(topology) {
            return;
        }
        let type_changed = self.topology.map(PrimitiveTopology::topology_type)
            != Some(topology.topology_type());
        self.topology = Some(topology);
        self.dirty |= DirtyFlags::PRIMITIVE_TOPOLOGY;
        if type_changed && !self.explicit_graphics {
            self.dirty |= DirtyFlags::GRAPHICS_PIPELINE;
        }
    }

    pub fn set_blend_factor(&mut self, factor: [f32; 4]) {
        if self.blend_factor != factor {
            self.blend_factor = factor;
            self.dirty |= DirtyFlags::BLEND_FACTOR;
        }
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        if self.stencil_ref != reference {
            self.stencil_ref = reference;
            self.dirty |= DirtyFlags::STENCIL_REF;
        }
    }

    /// Binds stream output targets starting at slot 0. Binding none while
    /// none are bound does nothing.
    pub fn set_stream_out_targets(&mut self, targets: &[(Arc<Resource<A>>, u64)]) {
        if targets.len() > MAX_STREAM_OUT_TARGETS {
            fatal!(
                "{} stream output targets bound, the limit is {MAX_STREAM_OUT_TARGETS}",
                targets.len()
            );
        }
        let unchanged = targets.len() == self.stream_out.len()
            && targets
                .iter()
                .zip(&self.stream_out)
                .all(|((resource, offset), bound)| bound.is(resource, *offset));
        if unchanged {
            return;
        }
        self.stream_out = targets
            .iter()
            .map(|(resource, offset)| BufferBinding {
                resource: Arc::clone(resource),
                offset: *offset,
            })
            .collect();
        self.dirty |= DirtyFlags::STREAM_OUT;
    }

    // Whole-state operations

    /// Unbinds everything.
    pub fn clear_state(&mut self) {
        self.shaders = Default::default();
        self.vertex_declaration = None;
        self.graphics = GraphicsState::default();
        self.graphics_pipeline = None;
        self.compute_pipeline = None;
        self.explicit_graphics = false;
        self.explicit_compute = false;
        self.stages = std::array::from_fn(|_| StageBindings::new());
        self.vertex_buffers = std::array::from_fn(|_| None);
        self.index_buffer = None;
        self.render_targets.clear();
        self.depth_stencil = None;
        self.viewport = None;
        self.scissor = None;
        self.topology = None;
        self.blend_factor = [1.0; 4];
        self.stencil_ref = 0;
        self.stream_out.clear();
        self.dirty_state();
    }

    /// Marks everything dirty, for a command list that has nothing bound.
    pub fn dirty_state(&mut self) {
        self.dirty = DirtyFlags::all();
        self.bound_root_signatures = [None, None];
        self.bound_pipeline = None;
        self.dirty_all_tables();
    }

    fn dirty_all_tables(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.dirty = SlotMasks::ALL;
        }
    }

    // Application

    /// Records all state a draw (or a dispatch when `compute` is set) needs.
    pub fn apply_state(
        &mut self,
        device: &Device<A>,
        list: &mut CommandList<A>,
        compute: bool,
    ) -> Result<(), ApplyStateError> {
        profiling::scope!("StateCache::apply_state");
        if compute {
            let pipeline = self.resolve_compute_pipeline(device)?;
            let stages = [ShaderStage::Compute];
            self.transition_bound_views(list, pipeline.root_signature(), &stages);
            self.bind_pipeline(
                list,
                BindPoint::Compute,
                pipeline.id(),
                pipeline.raw(),
                pipeline.root_signature(),
                &stages,
            );
            self.apply_descriptor_tables(
                device,
                list,
                BindPoint::Compute,
                pipeline.root_signature(),
                &stages,
            )?;
        } else {
            let pipeline = self.resolve_graphics_pipeline(device)?;
            let stages = ShaderStage::GRAPHICS;
            self.transition_bound_views(list, pipeline.root_signature(), &stages);
            self.transition_graphics_targets(list, &pipeline.desc().depth_stencil);
            self.bind_pipeline(
                list,
                BindPoint::Graphics,
                pipeline.id(),
                pipeline.raw(),
                pipeline.root_signature(),
                &stages,
            );
            self.apply_descriptor_tables(
                device,
                list,
                BindPoint::Graphics,
                pipeline.root_signature(),
                &stages,
            )?;
            self.apply_graphics_state(list);
        }
        Ok(())
    }

    fn resolve_graphics_pipeline(
        &mut self,
        device: &Device<A>,
    ) -> Result<Arc<GraphicsPipeline<A>>, CreatePipelineError> {
        if self.dirty.contains(DirtyFlags::GRAPHICS_PIPELINE) && !self.explicit_graphics {
            let desc = self.graphics_desc();
            let pipeline =
                device
                    .pipelines()
                    .find_graphics(device.raw(), device.root_signatures(), &desc)?;
            self.graphics_pipeline = Some(pipeline);
        }
        self.dirty.remove(DirtyFlags::GRAPHICS_PIPELINE);
        match self.graphics_pipeline {
            Some(ref pipeline) => Ok(Arc::clone(pipeline)),
            None => fatal!("Draw without a graphics pipeline"),
        }
    }

    fn resolve_compute_pipeline(
        &mut self,
        device: &Device<A>,
    ) -> Result<Arc<ComputePipeline<A>>, CreatePipelineError> {
        if self.dirty.contains(DirtyFlags::COMPUTE_PIPELINE) && !self.explicit_compute {
            let Some(shader) = self.shaders[ShaderStage::Compute.index()].clone() else {
                fatal!("Dispatch without a compute shader");
            };
            let pipeline =
                device
                    .pipelines()
                    .find_compute(device.raw(), device.root_signatures(), &shader)?;
            self.compute_pipeline = Some(pipeline);
        }
        self.dirty.remove(DirtyFlags::COMPUTE_PIPELINE);
        match self.compute_pipeline {
            Some(ref pipeline) => Ok(Arc::clone(pipeline)),
            None => fatal!("Dispatch without a compute pipeline"),
        }
    }

    fn graphics_desc(&self) -> GraphicsPipelineDesc {
        let Some(vertex) = self.shaders[ShaderStage::Vertex.index()].clone() else {
            fatal!("Draw without a vertex shader");
        };
        let shader = |stage: ShaderStage| self.shaders[stage.index()].clone();
        GraphicsPipelineDesc {
            vertex,
            hull: shader(ShaderStage::Hull),
            domain: shader(ShaderStage::Domain),
            geometry: shader(ShaderStage::Geometry),
            pixel: shader(ShaderStage::Pixel),
            vertex_declaration: self.vertex_declaration.clone(),
            blend: self.graphics.blend,
            rasterizer: self.graphics.rasterizer,
            depth_stencil: self.graphics.depth_stencil,
            sample_mask: self.graphics.sample_mask,
            topology_type: self
                .topology
                .map_or(hal::PrimitiveTopologyType::Triangle, |t| t.topology_type()),
            render_target_formats: self.render_targets.iter().map(|view| view.format()).collect(),
            depth_stencil_format: self
                .depth_stencil
                .as_ref()
                .map_or(Format::Unknown, |view| view.format()),
            sample_count: 1,
        }
    }

    fn transition_bound_views(
        &self,
        list: &mut CommandList<A>,
        root_signature: &RootSignature<A>,
        stages: &[ShaderStage],
    ) {
        for &stage in stages {
            let bindings = &self.stages[stage.index()];
            for ty in &RANGE_TYPES[..3] {
                let state = match *ty {
                    DescriptorRangeType::Srv => stage.shader_resource_state(),
                    DescriptorRangeType::Cbv => ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
                    _ => ResourceStates::UNORDERED_ACCESS,
                };
                let size = root_signature.table_size(stage, *ty) as usize;
                for view in bindings.views(*ty)[..size].iter().flatten() {
                    list.transition_resource(view.resource(), Some(view.range()), state);
                }
            }
        }
    }

    fn transition_graphics_targets(
        &self,
        list: &mut CommandList<A>,
        depth_stencil: &DepthStencilState,
    ) {
        for (binding, _) in self.vertex_buffers.iter().flatten() {
            list.transition_resource(
                &binding.resource,
                None,
                ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
            );
        }
        if let Some((ref binding, _)) = self.index_buffer {
            list.transition_resource(&binding.resource, None, ResourceStates::INDEX_BUFFER);
        }
        for view in &self.render_targets {
            list.transition_resource(
                view.resource(),
                Some(view.range()),
                ResourceStates::RENDER_TARGET,
            );
        }
        if let Some(ref view) = self.depth_stencil {
            let state = if view.is_read_only() {
                ResourceStates::DEPTH_READ
            } else {
                depth_stencil.depth_target_state()
            };
            list.transition_resource(view.resource(), Some(view.range()), state);
        }
        for binding in &self.stream_out {
            list.transition_resource(&binding.resource, None, ResourceStates::STREAM_OUT);
        }
    }

    fn bind_pipeline(
        &mut self,
        list: &mut CommandList<A>,
        bind_point: BindPoint,
        id: TrackerId,
        raw: &A::PipelineState,
        root_signature: &Arc<RootSignature<A>>,
        stages: &[ShaderStage],
    ) {
        let bound = &mut self.bound_root_signatures[bind_point as usize];
        if !same(bound.as_ref(), Some(root_signature)) {
            list.raw_mut()
                .set_root_signature(bind_point, root_signature.raw());
            *bound = Some(Arc::clone(root_signature));
            for &stage in stages {
                self.stages[stage.index()].dirty = SlotMasks::ALL;
            }
        }
        if self.bound_pipeline != Some(id) {
            list.raw_mut().set_pipeline_state(raw);
            self.bound_pipeline = Some(id);
        }
    }

    fn sampler_table(
        &self,
        device: &Device<A>,
        stage: ShaderStage,
        size: usize,
    ) -> ArrayVec<Arc<Sampler<A>>, MAX_SAMPLERS> {
        self.stages[stage.index()].samplers[..size]
            .iter()
            .map(|sampler| match *sampler {
                Some(ref sampler) => Arc::clone(sampler),
                None => Arc::clone(device.null_sampler()),
            })
            .collect()
    }

    fn apply_descriptor_tables(
        &mut self,
        device: &Device<A>,
        list: &mut CommandList<A>,
        bind_point: BindPoint,
        root_signature: &RootSignature<A>,
        stages: &[ShaderStage],
    ) -> Result<(), DeviceError> {
        let mut rollovers = 0;
        let (mut view_slot, mut sampler_slot, cached_samplers) = loop {
            // Sampler tables already in the global heap.
            let mut cached = ArrayVec::<_, { ShaderStage::COUNT }>::new();
            let mut missed = false;
            if self.descriptors.uses_global_samplers() {
                for &stage in stages {
                    let size = root_signature.table_size(stage, DescriptorRangeType::Sampler);
                    if size == 0 || !self.is_table_dirty(stage, DescriptorRangeType::Sampler) {
                        continue;
                    }
                    let key: ArrayVec<TrackerId, MAX_SAMPLERS> = self
                        .sampler_table(device, stage, size as usize)
                        .iter()
                        .map(|sampler| sampler.id())
                        .collect();
                    match self.descriptors.find_global_sampler_table(&key) {
                        Some(base) => cached.push((stage, base)),
                        None => {
                            missed = true;
                            break;
                        }
                    }
                }
            }
            if missed {
                // Happens at most once per command list.
                self.descriptors.switch_to_local_samplers();
                self.dirty_all_tables();
                self.dirty |= DirtyFlags::DESCRIPTOR_HEAPS;
                continue;
            }

            let mut views = 0;
            let mut samplers = 0;
            for &stage in stages {
                for ty in RANGE_TYPES {
                    let size = root_signature.table_size(stage, ty);
                    if size == 0 || !self.is_table_dirty(stage, ty) {
                        continue;
                    }
                    match ty {
                        DescriptorRangeType::Sampler => {
                            if !self.descriptors.uses_global_samplers() {
                                samplers += size;
                            }
                        }
                        _ => views += size,
                    }
                }
            }

            let (views_fit, samplers_fit) = self.descriptors.can_reserve(views, samplers);
            if views_fit && samplers_fit {
                let (view_base, sampler_base) = self.descriptors.reserve(views, samplers);
                break (view_base, sampler_base, cached);
            }
            if rollovers == 2 {
                fatal!("{views} view and {samplers} sampler descriptors do not fit in the online heaps");
            }
            rollovers += 1;
            self.descriptors
                .roll_over(device, !views_fit, !samplers_fit)?;
            self.dirty_all_tables();
            self.dirty |= DirtyFlags::DESCRIPTOR_HEAPS;
        };

        if self.dirty.contains(DirtyFlags::DESCRIPTOR_HEAPS) {
            self.descriptors.bind_heaps(list.raw_mut());
            self.dirty.remove(DirtyFlags::DESCRIPTOR_HEAPS);
        }

        for &stage in stages {
            for ty in RANGE_TYPES {
                let Some(index) = root_signature.table_slot(stage, ty) else {
                    continue;
                };
                if !self.is_table_dirty(stage, ty) {
                    continue;
                }
                let size = root_signature.table_size(stage, ty);
                let base = match ty {
                    DescriptorRangeType::Sampler => {
                        match cached_samplers.iter().find(|&&(cached, _)| cached == stage) {
                            Some(&(_, base)) => base,
                            None => {
                                let table = self.sampler_table(device, stage, size as usize);
                                let base = self.descriptors.write_sampler_table(
                                    device.raw(),
                                    sampler_slot,
                                    table,
                                );
                                sampler_slot += size;
                                base
                            }
                        }
                    }
                    _ => {
                        let null = device.null_descriptor(view_kind(ty));
                        let sources: ArrayVec<CpuDescriptor, MAX_SRVS> = self.stages
                            [stage.index()]
                        .views(ty)[..size as usize]
                            .iter()
                            .map(|view| view.as_ref().map_or(null, |view| view.descriptor()))
                            .collect();
                        let base =
                            self.descriptors
                                .write_view_table(device.raw(), view_slot, &sources);
                        view_slot += size;
                        base
                    }
                };
                list.raw_mut()
                    .set_root_descriptor_table(bind_point, index, base);
                self.stages[stage.index()].dirty.clear(ty);
            }
        }
        Ok(())
    }

    fn apply_graphics_state(&mut self, list: &mut CommandList<A>) {
        let dirty = self.dirty & DirtyFlags::GRAPHICS_STATE;
        if dirty.is_empty() {
            return;
        }
        let raw = list.raw_mut();

        if dirty.contains(DirtyFlags::VERTEX_BUFFERS) {
            let count = self
                .vertex_buffers
                .iter()
                .rposition(Option::is_some)
                .map_or(0, |last| last + 1);
            let views: ArrayVec<VertexBufferView, MAX_VERTEX_STREAMS> = self.vertex_buffers
                [..count]
                .iter()
                .map(|binding| match *binding {
                    Some((ref binding, stride)) => VertexBufferView {
                        address: binding.address(),
                        size: binding.size() as u32,
                        stride,
                    },
                    None => VertexBufferView::default(),
                })
                .collect();
            raw.set_vertex_buffers(0, &views);
        }
        if dirty.contains(DirtyFlags::INDEX_BUFFER) {
            let view = self
                .index_buffer
                .as_ref()
                .map(|(binding, format)| IndexBufferView {
                    address: binding.address(),
                    size: binding.size() as u32,
                    format: *format,
                });
            raw.set_index_buffer(view.as_ref());
        }
        if dirty.contains(DirtyFlags::RENDER_TARGETS) {
            let colors: ArrayVec<CpuDescriptor, MAX_RENDER_TARGETS> = self
                .render_targets
                .iter()
                .map(|view| view.descriptor())
                .collect();
            let depth = self.depth_stencil.as_ref().map(|view| view.descriptor());
            raw.set_render_targets(&colors, depth);
        }
        if dirty.contains(DirtyFlags::VIEWPORTS) {
            if let Some(ref viewport) = self.viewport {
                raw.set_viewports(std::slice::from_ref(viewport));
            }
        }
        if dirty.contains(DirtyFlags::SCISSORS) {
            if let Some(ref rect) = self.scissor {
                raw.set_scissor_rects(std::slice::from_ref(rect));
            }
        }
        if dirty.contains(DirtyFlags::PRIMITIVE_TOPOLOGY) {
            if let Some(topology) = self.topology {
                raw.set_primitive_topology(topology);
            }
        }
        if dirty.contains(DirtyFlags::BLEND_FACTOR) {
            raw.set_blend_factor(self.blend_factor);
        }
        if dirty.contains(DirtyFlags::STENCIL_REF) {
            raw.set_stencil_ref(self.stencil_ref);
        }
        if dirty.contains(DirtyFlags::STREAM_OUT) {
            let views: ArrayVec<StreamOutView, MAX_STREAM_OUT_TARGETS> = self
                .stream_out
                .iter()
                .map(|binding| StreamOutView {
                    address: binding.address(),
                    size: binding.size(),
                })
                .collect();
            raw.set_stream_output_targets(0, &views);
        }
        self.dirty.remove(DirtyFlags::GRAPHICS_STATE);
    }
}

impl<A: HalApi> fmt::Debug for StateCache<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCache")
            .field("dirty", &self.dirty)
            .field("graphics_pipeline", &self.graphics_pipeline)
            .field("compute_pipeline", &self.compute_pipeline)
            .field("render_targets", &self.render_targets.len())
            .field("viewport", &self.viewport)
            .field("scissor", &self.scissor)
            .finish()
    }
}
