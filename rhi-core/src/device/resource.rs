use std::{fmt, sync::Arc};

use arrayvec::ArrayVec;
use hal::{
    CpuDescriptor, DescriptorHeapType, Device as _, Format, QueueType, ResourceDescriptor,
    SamplerDescriptor, SubresourceRange, ViewDescriptor, ViewKind,
};
use parking_lot::Mutex;
use thiserror::Error;

use super::DeviceError;
use crate::{
    api_log,
    command::CommandListManager,
    context::CommandContext,
    descriptor::{GlobalOnlineHeap, GlobalSamplerTableCache, OfflineDescriptor, OfflineDescriptorManager},
    hal_api::HalApi,
    pipeline::{PipelineStateCache, RootSignatureCache},
    resource::{Resource, Sampler, View},
    resource_log, FastHashMap, Settings,
};

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum CreateViewError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Range {range:?} is outside of a resource with {mips} mips and {layers} layers")]
    RangeOutOfBounds {
        range: SubresourceRange,
        mips: u32,
        layers: u32,
    },
    #[error("{kind:?} view can't be created with format {format:?}")]
    InvalidFormat { kind: ViewKind, format: Format },
    #[error("{kind:?} view can't be created on a buffer")]
    BufferNotAllowed { kind: ViewKind },
    #[error("Constant buffer view [{offset}, {offset} + {size}) is outside of a {buffer_size} byte buffer")]
    BufferRangeOutOfBounds {
        offset: u64,
        size: u32,
        buffer_size: u64,
    },
}

impl From<hal::DeviceError> for CreateViewError {
    fn from(error: hal::DeviceError) -> Self {
        Self::Device(error.into())
    }
}

/// A logical device and everything shared by the contexts recording for it.
///
/// Queues, global heaps and caches are created up front and live as long as
/// the device. All of them are internally synchronized, so a device is
/// shared between threads through an `Arc` and every recording thread owns
/// its own [`CommandContext`].
pub struct Device<A: HalApi> {
    raw: A::Device,
    settings: Settings,
    /// Indexed by [`QueueType::index`].
    queues: ArrayVec<CommandListManager<A>, 3>,
    global_view_heap: Arc<GlobalOnlineHeap<A>>,
    sampler_table_cache: Arc<GlobalSamplerTableCache<A>>,
    /// Indexed by [`DescriptorHeapType::index`].
    offline: [Arc<OfflineDescriptorManager<A>>; 4],
    root_signatures: RootSignatureCache<A>,
    pipelines: PipelineStateCache<A>,
    samplers: Mutex<FastHashMap<SamplerDescriptor, Arc<Sampler<A>>>>,
    /// Null shader resource, constant buffer and unordered access views.
    null_views: [OfflineDescriptor<A>; 3],
    null_sampler: Arc<Sampler<A>>,
}

impl<A: HalApi> Device<A> {
    pub fn new(raw: A::Device, settings: Settings) -> Result<Arc<Self>, DeviceError> {
        let settings = settings.sanitized();
        api_log!("Device::new {settings:?}");

        let queues = QueueType::ALL
            .into_iter()
            .map(|ty| CommandListManager::new(&raw, ty, &settings))
            .collect::<Result<ArrayVec<_, 3>, _>>()?;
        let global_view_heap = Arc::new(GlobalOnlineHeap::new(
            &raw,
            DescriptorHeapType::CbvSrvUav,
            settings.global_view_heap_size,
            settings.online_block_size,
        )?);
        let global_sampler_heap = Arc::new(GlobalOnlineHeap::new(
            &raw,
            DescriptorHeapType::Sampler,
            settings.global_sampler_heap_size,
            settings.global_sampler_heap_size,
        )?);
        let offline = DescriptorHeapType::ALL.map(|ty| {
            Arc::new(OfflineDescriptorManager::new(
                &raw,
                ty,
                settings.offline_page_size,
            ))
        });

        let null_view = |kind: ViewKind| -> Result<OfflineDescriptor<A>, DeviceError> {
            let descriptor = offline[kind.heap_type().index()].allocate(&raw)?;
            raw.write_descriptor(descriptor.handle(), &ViewDescriptor::Null(kind));
            Ok(descriptor)
        };
        let null_views = [
            null_view(ViewKind::ShaderResource)?,
            null_view(ViewKind::ConstantBuffer)?,
            null_view(ViewKind::UnorderedAccess)?,
        ];
        let null_sampler = {
            let desc = SamplerDescriptor::default();
            let descriptor = offline[DescriptorHeapType::Sampler.index()].allocate(&raw)?;
            raw.write_descriptor(descriptor.handle(), &ViewDescriptor::Sampler(desc));
            Arc::new(Sampler::new(desc, descriptor))
        };
        let mut samplers = FastHashMap::default();
        samplers.insert(*null_sampler.desc(), Arc::clone(&null_sampler));

        Ok(Arc::new(Self {
            raw,
            settings,
            queues,
            global_view_heap,
            sampler_table_cache: Arc::new(GlobalSamplerTableCache::new(global_sampler_heap)),
            offline,
            root_signatures: RootSignatureCache::new(),
            pipelines: PipelineStateCache::new(),
            samplers: Mutex::new(samplers),
            null_views,
            null_sampler,
        }))
    }

    pub fn raw(&self) -> &A::Device {
        &self.raw
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The command list manager owning the queue of type `ty`.
    pub fn queue(&self, ty: QueueType) -> &CommandListManager<A> {
        &self.queues[ty.index()]
    }

    pub fn global_view_heap(&self) -> &Arc<GlobalOnlineHeap<A>> {
        &self.global_view_heap
    }

    pub fn sampler_table_cache(&self) -> &Arc<GlobalSamplerTableCache<A>> {
        &self.sampler_table_cache
    }

    pub fn offline_descriptors(&self, ty: DescriptorHeapType) -> &Arc<OfflineDescriptorManager<A>> {
        &self.offline[ty.index()]
    }

    pub fn root_signatures(&self) -> &RootSignatureCache<A> {
        &self.root_signatures
    }

    pub fn pipelines(&self) -> &PipelineStateCache<A> {
        &self.pipelines
    }

    /// A descriptor of `kind` that reads zeros, for unbound table slots.
    pub fn null_descriptor(&self, kind: ViewKind) -> CpuDescriptor {
        match kind {
            ViewKind::ShaderResource => self.null_views[0].handle(),
            ViewKind::ConstantBuffer => self.null_views[1].handle(),
            ViewKind::UnorderedAccess => self.null_views[2].handle(),
            ViewKind::Sampler => self.null_sampler.descriptor(),
            ViewKind::RenderTarget | ViewKind::DepthStencil => {
                crate::fatal!("No null descriptor for {kind:?} views")
            }
        }
    }

    /// The default sampler, bound to unbound sampler slots.
    pub fn null_sampler(&self) -> &Arc<Sampler<A>> {
        &self.null_sampler
    }

    pub fn create_context(self: &Arc<Self>, ty: QueueType) -> Result<CommandContext<A>, DeviceError> {
        CommandContext::new(Arc::clone(self), ty)
    }

    pub fn create_resource(&self, desc: &ResourceDescriptor) -> Result<Arc<Resource<A>>, DeviceError> {
        let raw = self.raw.create_resource(desc)?;
        let gpu_address = self.raw.resource_gpu_address(&raw);
        Ok(Arc::new(Resource::new(raw, desc, gpu_address)))
    }

    /// A shader resource view of `range`, or of the whole resource.
    pub fn create_shader_resource_view(
        &self,
        resource: &Arc<Resource<A>>,
        range: Option<SubresourceRange>,
    ) -> Result<Arc<View<A>>, CreateViewError> {
        let range = self.check_range(resource, range)?;
        let format = resource.desc().format;
        let desc = ViewDescriptor::ShaderResource {
            resource: resource.raw(),
            range,
            format,
        };
        self.make_view(ViewKind::ShaderResource, resource, range, format, false, &desc)
    }

    pub fn create_unordered_access_view(
        &self,
        resource: &Arc<Resource<A>>,
        range: Option<SubresourceRange>,
    ) -> Result<Arc<View<A>>, CreateViewError> {
        let range = self.check_range(resource, range)?;
        let format = resource.desc().format;
        if format.is_depth_stencil() {
            return Err(CreateViewError::InvalidFormat {
                kind: ViewKind::UnorderedAccess,
                format,
            });
        }
        let desc = ViewDescriptor::UnorderedAccess {
            resource: resource.raw(),
            range,
            format,
        };
        self.make_view(ViewKind::UnorderedAccess, resource, range, format, false, &desc)
    }

    pub fn create_constant_buffer_view(
        &self,
        resource: &Arc<Resource<A>>,
        offset: u64,
        size: u32,
    ) -> Result<Arc<View<A>>, CreateViewError> {
        let buffer_size = resource.desc().width;
        if !resource.is_buffer() {
            return Err(CreateViewError::InvalidFormat {
                kind: ViewKind::ConstantBuffer,
                format: resource.desc().format,
            });
        }
        let end = offset.checked_add(u64::from(size));
        if end.map_or(true, |end| end > buffer_size) {
            return Err(CreateViewError::BufferRangeOutOfBounds {
                offset,
                size,
                buffer_size,
            });
        }
        let desc = ViewDescriptor::ConstantBuffer {
            resource: resource.raw(),
            offset,
            size,
        };
        let range = SubresourceRange::single(0, 0);
        self.make_view(ViewKind::ConstantBuffer, resource, range, Format::Unknown, false, &desc)
    }

    pub fn create_render_target_view(
        &self,
        resource: &Arc<Resource<A>>,
        mip: u32,
        layer: u32,
    ) -> Result<Arc<View<A>>, CreateViewError> {
        let kind = ViewKind::RenderTarget;
        if resource.is_buffer() {
            return Err(CreateViewError::BufferNotAllowed { kind });
        }
        let format = resource.desc().format;
        if format.is_depth_stencil() || format == Format::Unknown {
            return Err(CreateViewError::InvalidFormat { kind, format });
        }
        let range = self.check_range(resource, Some(SubresourceRange::single(mip, layer)))?;
        let desc = ViewDescriptor::RenderTarget {
            resource: resource.raw(),
            mip,
            layer,
            format,
        };
        self.make_view(kind, resource, range, format, false, &desc)
    }

    /// A depth-stencil view. Read-only views keep the target in
    /// `DEPTH_READ` so it can be sampled while bound.
    pub fn create_depth_stencil_view(
        &self,
        resource: &Arc<Resource<A>>,
        mip: u32,
        layer: u32,
        read_only: bool,
    ) -> Result<Arc<View<A>>, CreateViewError> {
        let kind = ViewKind::DepthStencil;
        if resource.is_buffer() {
            return Err(CreateViewError::BufferNotAllowed { kind });
        }
        let format = resource.desc().format;
        if !format.is_depth_stencil() {
            return Err(CreateViewError::InvalidFormat { kind, format });
        }
        let range = self.check_range(resource, Some(SubresourceRange::single(mip, layer)))?;
        let desc = ViewDescriptor::DepthStencil {
            resource: resource.raw(),
            mip,
            layer,
            format,
            read_only,
        };
        self.make_view(kind, resource, range, format, read_only, &desc)
    }

    /// Samplers are deduplicated by description.
    pub fn create_sampler(&self, desc: &SamplerDescriptor) -> Result<Arc<Sampler<A>>, DeviceError> {
        let mut samplers = self.samplers.lock();
        if let Some(sampler) = samplers.get(desc) {
            return Ok(Arc::clone(sampler));
        }
        let descriptor = self.offline[DescriptorHeapType::Sampler.index()].allocate(&self.raw)?;
        self.raw
            .write_descriptor(descriptor.handle(), &ViewDescriptor::Sampler(*desc));
        let sampler = Arc::new(Sampler::new(*desc, descriptor));
        resource_log!("Created sampler {}", sampler.id());
        samplers.insert(*desc, Arc::clone(&sampler));
        Ok(sampler)
    }

    /// Blocks until every queue has finished all submitted work.
    pub fn wait_idle(&self) -> Result<(), DeviceError> {
        for queue in self.queues.iter() {
            queue.flush()?;
        }
        Ok(())
    }

    fn check_range(
        &self,
        resource: &Resource<A>,
        range: Option<SubresourceRange>,
    ) -> Result<SubresourceRange, CreateViewError> {
        let desc = resource.desc();
        let Some(range) = range else {
            return Ok(SubresourceRange::whole(desc));
        };
        let mips = desc.mip_level_count();
        let layers = desc.array_size();
        let fits = range.mip_count != 0
            && range.layer_count != 0
            && range.base_mip + range.mip_count <= mips
            && range.base_layer + range.layer_count <= layers;
        if !fits {
            return Err(CreateViewError::RangeOutOfBounds {
                range,
                mips,
                layers,
            });
        }
        Ok(range)
    }

    fn make_view(
        &self,
        kind: ViewKind,
        resource: &Arc<Resource<A>>,
        range: SubresourceRange,
        format: Format,
        read_only: bool,
        desc: &ViewDescriptor<'_, A>,
    ) -> Result<Arc<View<A>>, CreateViewError> {
        let descriptor = self.offline[kind.heap_type().index()].allocate(&self.raw)?;
        self.raw.write_descriptor(descriptor.handle(), desc);
        let view = View::new(kind, Arc::clone(resource), range, format, read_only, descriptor);
        resource_log!("Created {kind:?} view {} of resource {}", view.id(), resource.id());
        Ok(Arc::new(view))
    }
}

impl<A: HalApi> fmt::Debug for Device<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("backend", &A::VARIANT)
            .field("settings", &self.settings)
            .field("queues", &self.queues)
            .field("root_signatures", &self.root_signatures)
            .field("pipelines", &self.pipelines)
            .finish()
    }
}

impl<A: HalApi> Drop for Device<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw Device");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hal::{
        api::Soft,
        soft::{self, DescriptorContents, ExecutionMode},
        FilterMode, HeapKind, ResourceDimension, ResourceStates,
    };

    fn texture(format: Format, mips: u16, layers: u16) -> ResourceDescriptor<'static> {
        ResourceDescriptor {
            label: Some("texture"),
            dimension: ResourceDimension::Texture2D,
            width: 256,
            height: 128,
            depth_or_array_size: layers,
            mip_levels: mips,
            format,
            heap: HeapKind::Default,
            initial_state: ResourceStates::COMMON,
        }
    }

    #[test]
    fn samplers_are_deduplicated() {
        let device =
            Device::<Soft>::new(soft::Device::new(ExecutionMode::Immediate), Settings::default())
                .unwrap();
        let point = SamplerDescriptor {
            filter: FilterMode::Point,
            ..SamplerDescriptor::default()
        };
        let a = device.create_sampler(&point).unwrap();
        let b = device.create_sampler(&point).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let default = device.create_sampler(&SamplerDescriptor::default()).unwrap();
        assert!(Arc::ptr_eq(&default, device.null_sampler()));
    }

    #[test]
    fn views_are_validated_and_written() {
        let soft = soft::Device::new(ExecutionMode::Immediate);
        let device = Device::<Soft>::new(soft, Settings::default()).unwrap();
        let color = device
            .create_resource(&texture(Format::R8G8B8A8Unorm, 4, 2))
            .unwrap();
        let depth = device
            .create_resource(&texture(Format::D32Float, 1, 1))
            .unwrap();

        let srv = device
            .create_shader_resource_view(&color, Some(SubresourceRange::single(3, 1)))
            .unwrap();
        assert!(!srv.is_whole_resource());
        assert!(matches!(
            device.create_shader_resource_view(&color, Some(SubresourceRange::single(4, 0))),
            Err(CreateViewError::RangeOutOfBounds { mips: 4, layers: 2, .. })
        ));
        assert!(matches!(
            device.create_render_target_view(&depth, 0, 0),
            Err(CreateViewError::InvalidFormat { .. })
        ));
        assert!(matches!(
            device.create_depth_stencil_view(&color, 0, 0, false),
            Err(CreateViewError::InvalidFormat { .. })
        ));
        let dsv = device.create_depth_stencil_view(&depth, 0, 0, true).unwrap();
        assert!(dsv.is_read_only());

        let contents = device.raw().read_descriptor(srv.descriptor()).unwrap();
        assert_eq!(contents.resource(), Some(color.raw().id()));
        assert!(matches!(
            device
                .raw()
                .read_descriptor(device.null_descriptor(ViewKind::UnorderedAccess)),
            Some(DescriptorContents::Null(ViewKind::UnorderedAccess))
        ));
    }

    #[test]
    fn constant_buffer_views_stay_inside_the_buffer() {
        let device =
            Device::<Soft>::new(soft::Device::new(ExecutionMode::Immediate), Settings::default())
                .unwrap();
        let buffer = device
            .create_resource(&ResourceDescriptor::buffer(Some("cb"), 512, HeapKind::Upload))
            .unwrap();
        assert!(device.create_constant_buffer_view(&buffer, 256, 256).is_ok());
        assert!(matches!(
            device.create_constant_buffer_view(&buffer, 384, 256),
            Err(CreateViewError::BufferRangeOutOfBounds { buffer_size: 512, .. })
        ));
        assert!(matches!(
            device.create_constant_buffer_view(&buffer, u64::MAX - 16, 256),
            Err(CreateViewError::BufferRangeOutOfBounds {
                offset,
                ..
            }) if offset == u64::MAX - 16
        ));
    }
}
