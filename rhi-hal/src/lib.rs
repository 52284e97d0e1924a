/*! A low-level abstraction over descriptor-heap based graphics APIs.
 *
 * This crate describes the driver surface that `rhi-core` drives: devices,
 * queues, fences, command allocators and command lists, descriptor heaps,
 * root signatures, pipeline state objects and resources. The model follows
 * the explicit descriptor-heap APIs closely:
 *
 * - Descriptors live in heaps. A heap is either CPU-only ("offline") or
 *   shader visible ("online"). Shaders only see descriptors that were copied
 *   into the shader-visible heap bound on the command list.
 * - Command lists record into command allocators. An allocator owns the
 *   memory of everything recorded into it and must not be reset until the
 *   GPU has finished executing that work.
 * - Fences are monotonically increasing counters signalled from a queue.
 *   They are the only way the CPU learns about GPU progress.
 * - Resource usage is expressed as [`ResourceStates`], and a transition
 *   between states must be recorded as a [`Barrier`].
 *
 * The hal does no validation beyond what the backend needs to stay
 * consistent. Tracking what is safe to do is the job of `rhi-core`.
 *
 * The [`soft`] backend simulates an asynchronous GPU timeline in memory.
 */

#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unsafe_op_in_unsafe_fn,
    unused_extern_crates,
    unused_qualifications
)]

pub mod soft;

pub mod api {
    pub use super::soft::Api as Soft;
}

use std::{fmt, num::NonZeroU8};

use bitflags::bitflags;
use thiserror::Error;

pub const MAX_SRVS: usize = 64;
pub const MAX_CBS: usize = 16;
pub const MAX_UAVS: usize = 8;
pub const MAX_SAMPLERS: usize = 16;
pub const MAX_RENDER_TARGETS: usize = 8;
pub const MAX_VERTEX_STREAMS: usize = 16;
pub const MAX_STREAM_OUT_TARGETS: usize = 4;
/// Upper bound of a shader-visible sampler heap.
pub const MAX_SHADER_VISIBLE_SAMPLERS: u32 = 2048;
pub const VIEWPORT_BOUNDS_MAX: u32 = 32767;
pub const MAX_TEXTURE_DIMENSION_2D: u32 = 16384;
/// Size limit of a root signature, in 32-bit values.
pub const MAX_ROOT_COST: u32 = 64;

pub type FenceValue = u64;
pub type Label<'a> = Option<&'a str>;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DeviceError {
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device is lost")]
    Lost,
    #[error("Creation of a resource failed for a reason other than running out of memory.")]
    ResourceCreationFailed,
    #[error("Unexpected error variant (driver implementation is at fault)")]
    Unexpected,
}

/// Objects of every backend must be shareable between recording threads.
pub trait MaybeSendSync: Send + Sync {}
impl<T: Send + Sync> MaybeSendSync for T {}

pub trait Api: Clone + fmt::Debug + Sized + 'static {
    type Device: Device<A = Self>;
    type Queue: Queue<A = Self>;
    type Fence: Fence;
    type CommandAllocator: MaybeSendSync + fmt::Debug;
    type CommandList: CommandList<A = Self>;
    type DescriptorHeap: MaybeSendSync + fmt::Debug;
    type RootSignature: MaybeSendSync + fmt::Debug;
    type PipelineState: MaybeSendSync + fmt::Debug;
    type Resource: MaybeSendSync + fmt::Debug;
}

pub trait Device: MaybeSendSync {
    type A: Api;

    fn create_queue(&self, ty: QueueType) -> Result<<Self::A as Api>::Queue, DeviceError>;
    fn create_fence(&self) -> Result<<Self::A as Api>::Fence, DeviceError>;

    fn create_command_allocator(
        &self,
        ty: QueueType,
    ) -> Result<<Self::A as Api>::CommandAllocator, DeviceError>;
    /// Reclaim all memory of commands recorded into `allocator`.
    ///
    /// The GPU must have finished every command list recorded into it.
    fn reset_command_allocator(
        &self,
        allocator: &mut <Self::A as Api>::CommandAllocator,
    ) -> Result<(), DeviceError>;
    /// Create a command list in the recording state, recording into `allocator`.
    fn create_command_list(
        &self,
        ty: QueueType,
        allocator: &mut <Self::A as Api>::CommandAllocator,
        label: Label,
    ) -> Result<<Self::A as Api>::CommandList, DeviceError>;

    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDescriptor,
    ) -> Result<<Self::A as Api>::DescriptorHeap, DeviceError>;
    /// Distance between two consecutive descriptors of a heap of type `ty`.
    fn descriptor_increment(&self, ty: DescriptorHeapType) -> u32;
    fn heap_cpu_start(&self, heap: &<Self::A as Api>::DescriptorHeap) -> CpuDescriptor;
    /// Only meaningful for shader-visible heaps.
    fn heap_gpu_start(&self, heap: &<Self::A as Api>::DescriptorHeap) -> GpuDescriptor;
    fn write_descriptor(&self, dst: CpuDescriptor, view: &ViewDescriptor<'_, Self::A>);
    /// Gather `srcs` into the contiguous range starting at `dst`.
    fn copy_descriptors(&self, dst: CpuDescriptor, srcs: &[CpuDescriptor], ty: DescriptorHeapType);

    fn create_root_signature(
        &self,
        desc: &RootSignatureDescriptor,
    ) -> Result<<Self::A as Api>::RootSignature, DeviceError>;
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor<'_, Self::A>,
    ) -> Result<<Self::A as Api>::PipelineState, DeviceError>;
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor<'_, Self::A>,
    ) -> Result<<Self::A as Api>::PipelineState, DeviceError>;

    fn create_resource(
        &self,
        desc: &ResourceDescriptor,
    ) -> Result<<Self::A as Api>::Resource, DeviceError>;
    fn resource_gpu_address(&self, resource: &<Self::A as Api>::Resource) -> u64;
}

pub trait Queue: MaybeSendSync {
    type A: Api;

    fn queue_type(&self) -> QueueType;
    /// Submit closed command lists for execution, in order.
    fn submit(&self, lists: &[&<Self::A as Api>::CommandList]) -> Result<(), DeviceError>;
    /// Enqueue a signal of `fence` to `value` behind all submitted work.
    fn signal(&self, fence: &<Self::A as Api>::Fence, value: FenceValue)
        -> Result<(), DeviceError>;
    /// Make this queue wait on the GPU until `fence` reaches `value`.
    fn wait(&self, fence: &<Self::A as Api>::Fence, value: FenceValue) -> Result<(), DeviceError>;
}

pub trait Fence: MaybeSendSync + fmt::Debug {
    fn completed_value(&self) -> Result<FenceValue, DeviceError>;
    /// Block until the fence reaches `value`.
    ///
    /// Returns `Ok(false)` when `timeout_ms` elapsed first.
    fn wait(&self, value: FenceValue, timeout_ms: u32) -> Result<bool, DeviceError>;
}

/// Recording interface of a command list.
///
/// Every method except `reset` requires the list to be recording.
pub trait CommandList: MaybeSendSync + fmt::Debug {
    type A: Api;

    fn reset(
        &mut self,
        allocator: &mut <Self::A as Api>::CommandAllocator,
    ) -> Result<(), DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;

    fn resource_barrier(&mut self, barriers: &[Barrier<'_, Self::A>]);

    fn set_descriptor_heaps(
        &mut self,
        view_heap: &<Self::A as Api>::DescriptorHeap,
        sampler_heap: &<Self::A as Api>::DescriptorHeap,
    );
    fn set_root_signature(
        &mut self,
        bind_point: BindPoint,
        root_signature: &<Self::A as Api>::RootSignature,
    );
    fn set_root_descriptor_table(&mut self, bind_point: BindPoint, index: u32, base: GpuDescriptor);
    fn set_pipeline_state(&mut self, pipeline: &<Self::A as Api>::PipelineState);

    fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]);
    fn set_index_buffer(&mut self, view: Option<&IndexBufferView>);
    fn set_render_targets(&mut self, color: &[CpuDescriptor], depth_stencil: Option<CpuDescriptor>);
    fn set_viewports(&mut self, viewports: &[Viewport]);
    fn set_scissor_rects(&mut self, rects: &[Rect]);
    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);
    fn set_blend_factor(&mut self, factor: [f32; 4]);
    fn set_stencil_ref(&mut self, reference: u32);
    fn set_stream_output_targets(&mut self, start_slot: u32, views: &[StreamOutView]);

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    );
    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn execute_indirect(
        &mut self,
        kind: IndirectKind,
        arguments: &<Self::A as Api>::Resource,
        offset: u64,
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueType {
    Direct,
    Compute,
    Copy,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Direct, QueueType::Compute, QueueType::Copy];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndirectKind {
    Draw,
    DrawIndexed,
    Dispatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DescriptorHeapType {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapType {
    pub const ALL: [DescriptorHeapType; 4] = [
        DescriptorHeapType::CbvSrvUav,
        DescriptorHeapType::Sampler,
        DescriptorHeapType::Rtv,
        DescriptorHeapType::Dsv,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Only view and sampler heaps can be bound to a command list.
    pub fn can_be_shader_visible(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }
}

#[derive(Clone, Debug)]
pub struct DescriptorHeapDescriptor<'a> {
    pub label: Label<'a>,
    pub ty: DescriptorHeapType,
    pub count: u32,
    pub shader_visible: bool,
}

/// CPU address of a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptor {
    pub ptr: u64,
}

impl CpuDescriptor {
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self {
            ptr: self.ptr + u64::from(count) * u64::from(increment),
        }
    }
}

/// GPU address of a descriptor in a shader-visible heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptor {
    pub ptr: u64,
}

impl GpuDescriptor {
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self {
            ptr: self.ptr + u64::from(count) * u64::from(increment),
        }
    }
}

bitflags! {
    /// Usage states of a resource or subresource.
    ///
    /// `COMMON` is the empty set and, unlike every other state, is not a
    /// single bit.
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const DEPTH_READ = 1 << 5;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 6;
        const PIXEL_SHADER_RESOURCE = 1 << 7;
        const STREAM_OUT = 1 << 8;
        const INDIRECT_ARGUMENT = 1 << 9;
        const COPY_DEST = 1 << 10;
        const COPY_SOURCE = 1 << 11;
        const RESOLVE_DEST = 1 << 12;
        const RESOLVE_SOURCE = 1 << 13;
        /// The state upload heaps live in for their whole life.
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
        const READ_ONLY = Self::GENERIC_READ.bits()
            | Self::DEPTH_READ.bits()
            | Self::RESOLVE_SOURCE.bits();
        const WRITABLE = Self::RENDER_TARGET.bits()
            | Self::UNORDERED_ACCESS.bits()
            | Self::DEPTH_WRITE.bits()
            | Self::STREAM_OUT.bits()
            | Self::COPY_DEST.bits()
            | Self::RESOLVE_DEST.bits();
    }
}

impl ResourceStates {
    /// True for a non-empty combination of read-only states.
    pub fn is_read_only(self) -> bool {
        !self.is_empty() && Self::READ_ONLY.contains(self)
    }
}

/// Selects the subresources a barrier applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subresource {
    All,
    Index(u32),
}

#[derive(Debug)]
pub enum Barrier<'a, A: Api> {
    Transition {
        resource: &'a A::Resource,
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    },
    /// Orders unordered-access work on `resource` without changing its state.
    Uav { resource: &'a A::Resource },
}

/// Closed set of shader stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShaderStage {
    Vertex,
    Hull,
    Domain,
    Pixel,
    Geometry,
    Compute,
}

impl ShaderStage {
    pub const COUNT: usize = 6;
    pub const ALL: [ShaderStage; Self::COUNT] = [
        ShaderStage::Vertex,
        ShaderStage::Hull,
        ShaderStage::Domain,
        ShaderStage::Pixel,
        ShaderStage::Geometry,
        ShaderStage::Compute,
    ];
    pub const GRAPHICS: [ShaderStage; 5] = [
        ShaderStage::Vertex,
        ShaderStage::Hull,
        ShaderStage::Domain,
        ShaderStage::Pixel,
        ShaderStage::Geometry,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn visibility(self) -> ShaderVisibility {
        match self {
            Self::Vertex => ShaderVisibility::Vertex,
            Self::Hull => ShaderVisibility::Hull,
            Self::Domain => ShaderVisibility::Domain,
            Self::Pixel => ShaderVisibility::Pixel,
            Self::Geometry => ShaderVisibility::Geometry,
            Self::Compute => ShaderVisibility::All,
        }
    }

    /// The state a shader resource view must be in to be read by this stage.
    pub fn shader_resource_state(self) -> ResourceStates {
        match self {
            Self::Pixel => ResourceStates::PIXEL_SHADER_RESOURCE,
            _ => ResourceStates::NON_PIXEL_SHADER_RESOURCE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShaderVisibility {
    All,
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
}

impl ShaderVisibility {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DescriptorRangeType {
    Srv,
    Cbv,
    Uav,
    Sampler,
}

/// A root parameter holding one descriptor table of a single range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootParameter {
    pub visibility: ShaderVisibility,
    pub range_type: DescriptorRangeType,
    pub count: u32,
    pub base_register: u32,
}

impl RootParameter {
    /// Cost in 32-bit root values. Descriptor tables take one.
    pub const COST: u32 = 1;
}

#[derive(Clone, Debug)]
pub struct RootSignatureDescriptor<'a> {
    pub label: Label<'a>,
    pub parameters: &'a [RootParameter],
    pub allow_input_assembler: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Format {
    #[default]
    Unknown,
    R8G8B8A8Unorm,
    B8G8R8A8Unorm,
    R10G10B10A2Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R32G32B32Float,
    R32G32Float,
    R32Float,
    R32Uint,
    R16Uint,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    pub fn is_depth_stencil(self) -> bool {
        matches!(self, Self::D32Float | Self::D24UnormS8Uint)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn stride(self) -> u32 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PrimitiveTopologyType {
    #[default]
    Undefined,
    Point,
    Line,
    Triangle,
    Patch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    /// Patch list with the given number of control points (1 to 32).
    PatchList(NonZeroU8),
}

impl PrimitiveTopology {
    pub fn topology_type(self) -> PrimitiveTopologyType {
        match self {
            Self::PointList => PrimitiveTopologyType::Point,
            Self::LineList | Self::LineStrip => PrimitiveTopologyType::Line,
            Self::TriangleList | Self::TriangleStrip => PrimitiveTopologyType::Triangle,
            Self::PatchList(_) => PrimitiveTopologyType::Patch,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
    Constant,
    OneMinusConstant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlendComponent {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
}

impl BlendComponent {
    pub const REPLACE: Self = Self {
        src: BlendFactor::One,
        dst: BlendFactor::Zero,
        op: BlendOp::Add,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RenderTargetBlend {
    pub enabled: bool,
    pub color: BlendComponent,
    pub alpha: BlendComponent,
    pub write_mask: u8,
}

impl Default for RenderTargetBlend {
    fn default() -> Self {
        Self {
            enabled: false,
            color: BlendComponent::REPLACE,
            alpha: BlendComponent::REPLACE,
            write_mask: 0xF,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlendState {
    pub alpha_to_coverage: bool,
    pub independent_blend: bool,
    pub render_targets: [RenderTargetBlend; MAX_RENDER_TARGETS],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FillMode {
    Wireframe,
    #[default]
    Solid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RasterizerState {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_bias: i32,
    pub depth_clip: bool,
    pub multisample: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_counter_clockwise: false,
            depth_bias: 0,
            depth_clip: true,
            multisample: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompareFunction {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StencilFace {
    pub compare: CompareFunction,
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
}

impl Default for StencilFace {
    fn default() -> Self {
        Self {
            compare: CompareFunction::Always,
            fail_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareFunction,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilFace,
    pub back: StencilFace,
}

impl DepthStencilState {
    /// The state a depth target must be in while this state is bound.
    pub fn depth_target_state(&self) -> ResourceStates {
        if self.depth_write || (self.stencil_enable && self.stencil_write_mask != 0) {
            ResourceStates::DEPTH_WRITE
        } else {
            ResourceStates::DEPTH_READ
        }
    }
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            depth_compare: CompareFunction::Less,
            stencil_enable: false,
            stencil_read_mask: 0xFF,
            stencil_write_mask: 0xFF,
            front: StencilFace::default(),
            back: StencilFace::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FilterMode {
    Point,
    #[default]
    Linear,
    Anisotropic,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressMode {
    #[default]
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SamplerDescriptor {
    pub filter: FilterMode,
    pub address_modes: [AddressMode; 3],
    pub max_anisotropy: u8,
    pub compare: Option<CompareFunction>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            filter: FilterMode::Linear,
            address_modes: [AddressMode::Wrap; 3],
            max_anisotropy: 1,
            compare: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexBufferView {
    pub address: u64,
    pub size: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexBufferView {
    pub address: u64,
    pub size: u32,
    pub format: IndexFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StreamOutView {
    pub address: u64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InputElement {
    pub semantic: String,
    pub semantic_index: u32,
    pub format: Format,
    pub slot: u32,
    pub offset: u32,
    pub per_instance: bool,
}

#[derive(Debug)]
pub struct GraphicsPipelineDescriptor<'a, A: Api> {
    pub label: Label<'a>,
    pub root_signature: &'a A::RootSignature,
    pub vertex: &'a [u8],
    pub hull: Option<&'a [u8]>,
    pub domain: Option<&'a [u8]>,
    pub geometry: Option<&'a [u8]>,
    pub pixel: Option<&'a [u8]>,
    pub input_layout: &'a [InputElement],
    pub blend: &'a BlendState,
    pub rasterizer: &'a RasterizerState,
    pub depth_stencil: &'a DepthStencilState,
    pub sample_mask: u32,
    pub topology_type: PrimitiveTopologyType,
    pub render_target_formats: &'a [Format],
    pub depth_stencil_format: Format,
    pub sample_count: u32,
}

#[derive(Debug)]
pub struct ComputePipelineDescriptor<'a, A: Api> {
    pub label: Label<'a>,
    pub root_signature: &'a A::RootSignature,
    pub shader: &'a [u8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer,
    Texture2D,
    Texture3D,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// GPU-local memory; state is tracked.
    #[default]
    Default,
    /// CPU-written memory, always in `GENERIC_READ`.
    Upload,
    /// CPU-read memory, always in `COPY_DEST`.
    Readback,
}

impl HeapKind {
    /// Resources in CPU-visible heaps can never change state.
    pub fn fixed_state(self) -> Option<ResourceStates> {
        match self {
            Self::Default => None,
            Self::Upload => Some(ResourceStates::GENERIC_READ),
            Self::Readback => Some(ResourceStates::COPY_DEST),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResourceDescriptor<'a> {
    pub label: Label<'a>,
    pub dimension: ResourceDimension,
    /// Byte size for buffers, texel width for textures.
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub heap: HeapKind,
    pub initial_state: ResourceStates,
}

impl ResourceDescriptor<'_> {
    pub fn buffer(label: Label<'_>, size: u64, heap: HeapKind) -> ResourceDescriptor<'_> {
        ResourceDescriptor {
            label,
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: Format::Unknown,
            heap,
            initial_state: heap.fixed_state().unwrap_or(ResourceStates::COMMON),
        }
    }

    pub fn array_size(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Texture2D => u32::from(self.depth_or_array_size.max(1)),
            ResourceDimension::Buffer | ResourceDimension::Texture3D => 1,
        }
    }

    pub fn mip_level_count(&self) -> u32 {
        u32::from(self.mip_levels.max(1))
    }

    /// Subresources are indexed `mip + layer * mip_level_count`.
    pub fn subresource_count(&self) -> u32 {
        self.mip_level_count() * self.array_size()
    }
}

/// A contiguous range of mips and array layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub fn single(mip: u32, layer: u32) -> Self {
        Self {
            base_mip: mip,
            mip_count: 1,
            base_layer: layer,
            layer_count: 1,
        }
    }

    pub fn whole(desc: &ResourceDescriptor) -> Self {
        Self {
            base_mip: 0,
            mip_count: desc.mip_level_count(),
            base_layer: 0,
            layer_count: desc.array_size(),
        }
    }

    /// Subresource indices covered by this range, for a resource with
    /// `mip_level_count` mips.
    pub fn indices(&self, mip_level_count: u32) -> impl Iterator<Item = u32> + '_ {
        let mips = self.base_mip..self.base_mip + self.mip_count;
        (self.base_layer..self.base_layer + self.layer_count)
            .flat_map(move |layer| mips.clone().map(move |mip| mip + layer * mip_level_count))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViewKind {
    ShaderResource,
    ConstantBuffer,
    UnorderedAccess,
    Sampler,
    RenderTarget,
    DepthStencil,
}

impl ViewKind {
    pub fn heap_type(self) -> DescriptorHeapType {
        match self {
            Self::ShaderResource | Self::ConstantBuffer | Self::UnorderedAccess => {
                DescriptorHeapType::CbvSrvUav
            }
            Self::Sampler => DescriptorHeapType::Sampler,
            Self::RenderTarget => DescriptorHeapType::Rtv,
            Self::DepthStencil => DescriptorHeapType::Dsv,
        }
    }
}

/// What to write into a descriptor slot.
#[derive(Debug)]
pub enum ViewDescriptor<'a, A: Api> {
    ShaderResource {
        resource: &'a A::Resource,
        range: SubresourceRange,
        format: Format,
    },
    UnorderedAccess {
        resource: &'a A::Resource,
        range: SubresourceRange,
        format: Format,
    },
    ConstantBuffer {
        resource: &'a A::Resource,
        offset: u64,
        size: u32,
    },
    RenderTarget {
        resource: &'a A::Resource,
        mip: u32,
        layer: u32,
        format: Format,
    },
    DepthStencil {
        resource: &'a A::Resource,
        mip: u32,
        layer: u32,
        format: Format,
        read_only: bool,
    },
    Sampler(SamplerDescriptor),
    /// A descriptor that reads zeros and drops writes.
    Null(ViewKind),
}

impl<A: Api> ViewDescriptor<'_, A> {
    pub fn kind(&self) -> ViewKind {
        match *self {
            Self::ShaderResource { .. } => ViewKind::ShaderResource,
            Self::UnorderedAccess { .. } => ViewKind::UnorderedAccess,
            Self::ConstantBuffer { .. } => ViewKind::ConstantBuffer,
            Self::RenderTarget { .. } => ViewKind::RenderTarget,
            Self::DepthStencil { .. } => ViewKind::DepthStencil,
            Self::Sampler(_) => ViewKind::Sampler,
            Self::Null(kind) => kind,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_only_states() {
        assert!(ResourceStates::PIXEL_SHADER_RESOURCE.is_read_only());
        assert!(ResourceStates::GENERIC_READ.is_read_only());
        assert!(!ResourceStates::COMMON.is_read_only());
        assert!(!(ResourceStates::COPY_SOURCE | ResourceStates::COPY_DEST).is_read_only());
    }

    #[test]
    fn subresource_indices() {
        let range = SubresourceRange {
            base_mip: 1,
            mip_count: 2,
            base_layer: 1,
            layer_count: 2,
        };
        let indices: Vec<u32> = range.indices(4).collect();
        assert_eq!(indices, [5, 6, 9, 10]);
    }

    #[test]
    fn descriptor_offsets() {
        let start = CpuDescriptor { ptr: 0x1000 };
        assert_eq!(start.offset(3, 32).ptr, 0x1000 + 96);
        let start = GpuDescriptor { ptr: 64 };
        assert_eq!(start.offset(0, 32), start);
    }
}
