use std::{fmt, sync::Arc};

use arrayvec::ArrayVec;
use hal::{
    BlendState, DepthStencilState, Device as _, Format, PrimitiveTopologyType, RasterizerState,
    ShaderStage, MAX_RENDER_TARGETS,
};
use parking_lot::Mutex;

use super::{
    CreatePipelineError, HitMiss, QuantizedBoundShaderState, RootSignature, RootSignatureCache,
    Shader, VertexDeclaration,
};
use crate::{
    hal_api::HalApi,
    resource::{next_tracker_id, TrackerId},
    resource_log, FastHashMap,
};

/// Everything a graphics pipeline is built from.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineDesc {
    pub vertex: Arc<Shader>,
    pub hull: Option<Arc<Shader>>,
    pub domain: Option<Arc<Shader>>,
    pub geometry: Option<Arc<Shader>>,
    pub pixel: Option<Arc<Shader>>,
    pub vertex_declaration: Option<Arc<VertexDeclaration>>,
    pub blend: BlendState,
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    pub sample_mask: u32,
    pub topology_type: PrimitiveTopologyType,
    pub render_target_formats: ArrayVec<Format, MAX_RENDER_TARGETS>,
    pub depth_stencil_format: Format,
    pub sample_count: u32,
}

impl GraphicsPipelineDesc {
    /// A pipeline running only `vertex`, with default fixed-function state.
    pub fn new(vertex: Arc<Shader>) -> Self {
        Self {
            vertex,
            hull: None,
            domain: None,
            geometry: None,
            pixel: None,
            vertex_declaration: None,
            blend: BlendState::default(),
            rasterizer: RasterizerState::default(),
            depth_stencil: DepthStencilState::default(),
            sample_mask: !0,
            topology_type: PrimitiveTopologyType::Triangle,
            render_target_formats: ArrayVec::new(),
            depth_stencil_format: Format::Unknown,
            sample_count: 1,
        }
    }

    /// The shader bound to `stage`.
    pub fn shader(&self, stage: ShaderStage) -> Option<&Arc<Shader>> {
        match stage {
            ShaderStage::Vertex => Some(&self.vertex),
            ShaderStage::Hull => self.hull.as_ref(),
            ShaderStage::Domain => self.domain.as_ref(),
            ShaderStage::Geometry => self.geometry.as_ref(),
            ShaderStage::Pixel => self.pixel.as_ref(),
            ShaderStage::Compute => None,
        }
    }

    pub fn shaders(&self) -> impl Iterator<Item = (ShaderStage, &Arc<Shader>)> + '_ {
        ShaderStage::GRAPHICS
            .into_iter()
            .filter_map(move |stage| self.shader(stage).map(|shader| (stage, shader)))
    }

    pub fn bound_shader_state(&self) -> QuantizedBoundShaderState {
        QuantizedBoundShaderState::graphics(
            self.shaders().map(|(stage, shader)| (stage, shader.counts())),
            self.vertex_declaration.is_some(),
        )
    }

    fn key(&self) -> GraphicsPipelineKey {
        let mut shaders = [None; 5];
        for (slot, stage) in shaders.iter_mut().zip(ShaderStage::GRAPHICS) {
            *slot = self.shader(stage).map(|shader| shader.id());
        }
        GraphicsPipelineKey {
            shaders,
            vertex_declaration: self.vertex_declaration.as_ref().map(|decl| decl.id()),
            blend: self.blend,
            rasterizer: self.rasterizer,
            depth_stencil: self.depth_stencil,
            sample_mask: self.sample_mask,
            topology_type: self.topology_type,
            render_target_formats: self.render_target_formats.clone(),
            depth_stencil_format: self.depth_stencil_format,
            sample_count: self.sample_count,
        }
    }

    fn validate(&self) -> Result<(), CreatePipelineError> {
        for (stage, shader) in self.shaders() {
            if shader.stage() != stage {
                return Err(CreatePipelineError::StageMismatch {
                    expected: stage,
                    actual: shader.stage(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct GraphicsPipelineKey {
    shaders: [Option<TrackerId>; 5],
    vertex_declaration: Option<TrackerId>,
    blend: BlendState,
    rasterizer: RasterizerState,
    depth_stencil: DepthStencilState,
    sample_mask: u32,
    topology_type: PrimitiveTopologyType,
    render_target_formats: ArrayVec<Format, MAX_RENDER_TARGETS>,
    depth_stencil_format: Format,
    sample_count: u32,
}

pub struct GraphicsPipeline<A: HalApi> {
    raw: A::PipelineState,
    id: TrackerId,
    root_signature: Arc<RootSignature<A>>,
    desc: GraphicsPipelineDesc,
}

impl<A: HalApi> GraphicsPipeline<A> {
    pub fn raw(&self) -> &A::PipelineState {
        &self.raw
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn root_signature(&self) -> &Arc<RootSignature<A>> {
        &self.root_signature
    }

    pub fn desc(&self) -> &GraphicsPipelineDesc {
        &self.desc
    }
}

impl<A: HalApi> fmt::Debug for GraphicsPipeline<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("id", &self.id)
            .field("root_signature", &self.root_signature)
            .finish()
    }
}

pub struct ComputePipeline<A: HalApi> {
    raw: A::PipelineState,
    id: TrackerId,
    root_signature: Arc<RootSignature<A>>,
    shader: Arc<Shader>,
}

impl<A: HalApi> ComputePipeline<A> {
    pub fn raw(&self) -> &A::PipelineState {
        &self.raw
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn root_signature(&self) -> &Arc<RootSignature<A>> {
        &self.root_signature
    }

    pub fn shader(&self) -> &Arc<Shader> {
        &self.shader
    }
}

impl<A: HalApi> fmt::Debug for ComputePipeline<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("id", &self.id)
            .field("shader", &self.shader.id())
            .finish()
    }
}

/// Pipelines by description. Never evicts.
pub struct PipelineStateCache<A: HalApi> {
    graphics: Mutex<FastHashMap<GraphicsPipelineKey, Arc<GraphicsPipeline<A>>>>,
    compute: Mutex<FastHashMap<TrackerId, Arc<ComputePipeline<A>>>>,
    counts: HitMiss,
}

impl<A: HalApi> PipelineStateCache<A> {
    pub fn new() -> Self {
        Self {
            graphics: Mutex::new(FastHashMap::default()),
            compute: Mutex::new(FastHashMap::default()),
            counts: HitMiss::default(),
        }
    }

    pub fn find_graphics(
        &self,
        device: &A::Device,
        root_signatures: &RootSignatureCache<A>,
        desc: &GraphicsPipelineDesc,
    ) -> Result<Arc<GraphicsPipeline<A>>, CreatePipelineError> {
        let key = desc.key();
        let mut map = self.graphics.lock();
        let found = map.get(&key).cloned();
        self.counts.record(found.is_some());
        if let Some(pipeline) = found {
            return Ok(pipeline);
        }

        profiling::scope!("PipelineStateCache::create_graphics");
        desc.validate()?;
        let root_signature = root_signatures.get_root_signature(device, &desc.bound_shader_state())?;
        let bytecode = |stage| desc.shader(stage).map(|shader| shader.bytecode());
        let input_layout = desc
            .vertex_declaration
            .as_ref()
            .map_or(&[][..], |decl| decl.elements());
        let raw = device.create_graphics_pipeline(&hal::GraphicsPipelineDescriptor {
            label: None,
            root_signature: root_signature.raw(),
            vertex: desc.vertex.bytecode(),
            hull: bytecode(ShaderStage::Hull),
            domain: bytecode(ShaderStage::Domain),
            geometry: bytecode(ShaderStage::Geometry),
            pixel: bytecode(ShaderStage::Pixel),
            input_layout,
            blend: &desc.blend,
            rasterizer: &desc.rasterizer,
            depth_stencil: &desc.depth_stencil,
            sample_mask: desc.sample_mask,
            topology_type: desc.topology_type,
            render_target_formats: &desc.render_target_formats,
            depth_stencil_format: desc.depth_stencil_format,
            sample_count: desc.sample_count,
        })?;

        let pipeline = Arc::new(GraphicsPipeline {
            raw,
            id: next_tracker_id(),
            root_signature,
            desc: desc.clone(),
        });
        resource_log!("Created graphics pipeline {}", pipeline.id);
        map.insert(key, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    pub fn find_compute(
        &self,
        device: &A::Device,
        root_signatures: &RootSignatureCache<A>,
        shader: &Arc<Shader>,
    ) -> Result<Arc<ComputePipeline<A>>, CreatePipelineError> {
        let mut map = self.compute.lock();
        let found = map.get(&shader.id()).cloned();
        self.counts.record(found.is_some());
        if let Some(pipeline) = found {
            return Ok(pipeline);
        }

        if shader.stage() != ShaderStage::Compute {
            return Err(CreatePipelineError::StageMismatch {
                expected: ShaderStage::Compute,
                actual: shader.stage(),
            });
        }
        let shape = QuantizedBoundShaderState::compute(shader.counts());
        let root_signature = root_signatures.get_root_signature(device, &shape)?;
        let raw = device.create_compute_pipeline(&hal::ComputePipelineDescriptor {
            label: None,
            root_signature: root_signature.raw(),
            shader: shader.bytecode(),
        })?;

        let pipeline = Arc::new(ComputePipeline {
            raw,
            id: next_tracker_id(),
            root_signature,
            shader: Arc::clone(shader),
        });
        resource_log!("Created compute pipeline {}", pipeline.id);
        map.insert(shader.id(), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Cached graphics and compute pipelines.
    pub fn len(&self) -> (usize, usize) {
        (self.graphics.lock().len(), self.compute.lock().len())
    }

    pub fn hit_miss_counts(&self) -> (u64, u64) {
        self.counts.get()
    }
}

impl<A: HalApi> Default for PipelineStateCache<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: HalApi> fmt::Debug for PipelineStateCache<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStateCache")
            .field("len", &self.len())
            .field("hit_miss", &self.hit_miss_counts())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::ShaderRegisterCounts;
    use hal::{
        api::Soft,
        soft::{self, ExecutionMode},
        CullMode,
    };

    fn shader(stage: ShaderStage, srv: u8) -> Arc<Shader> {
        Arc::new(Shader::new(
            stage,
            vec![0xD, 0x3, 0xD],
            ShaderRegisterCounts {
                srv,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn identical_descriptions_resolve_to_one_pipeline() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let root_signatures = RootSignatureCache::<Soft>::new();
        let cache = PipelineStateCache::<Soft>::new();

        let mut desc = GraphicsPipelineDesc::new(shader(ShaderStage::Vertex, 1));
        desc.pixel = Some(shader(ShaderStage::Pixel, 3));
        desc.render_target_formats.push(Format::R8G8B8A8Unorm);

        let first = cache.find_graphics(&device, &root_signatures, &desc).unwrap();
        let second = cache
            .find_graphics(&device, &root_signatures, &desc.clone())
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        desc.rasterizer.cull_mode = CullMode::None;
        let third = cache.find_graphics(&device, &root_signatures, &desc).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        // Same shaders, so the same root signature.
        assert!(Arc::ptr_eq(first.root_signature(), third.root_signature()));
        assert_eq!(cache.hit_miss_counts(), (1, 2));
        assert_eq!(cache.len(), (2, 0));
    }

    #[test]
    fn shaders_must_match_their_stage() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let root_signatures = RootSignatureCache::<Soft>::new();
        let cache = PipelineStateCache::<Soft>::new();

        let mut desc = GraphicsPipelineDesc::new(shader(ShaderStage::Vertex, 0));
        desc.pixel = Some(shader(ShaderStage::Compute, 0));
        assert!(matches!(
            cache.find_graphics(&device, &root_signatures, &desc),
            Err(CreatePipelineError::StageMismatch {
                expected: ShaderStage::Pixel,
                actual: ShaderStage::Compute,
            })
        ));

        let compute = shader(ShaderStage::Compute, 2);
        let a = cache.find_compute(&device, &root_signatures, &compute).unwrap();
        let b = cache.find_compute(&device, &root_signatures, &compute).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
