//! Descriptor heaps that remember what was written into them.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    CompareFunction, CpuDescriptor, DescriptorHeapType, Format, GpuDescriptor, SamplerDescriptor,
    SubresourceRange, ViewDescriptor, ViewKind,
};

/// Handles carry the heap id in the upper half and the byte offset of the
/// slot in the lower half.
const HEAP_ID_SHIFT: u32 = 32;
const GPU_HANDLE_BIT: u64 = 1 << 63;

pub(super) fn increment(ty: DescriptorHeapType) -> u32 {
    match ty {
        DescriptorHeapType::CbvSrvUav => 32,
        DescriptorHeapType::Sampler => 16,
        DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => 8,
    }
}

/// What a descriptor slot holds, with resources named by their id.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum DescriptorContents {
    #[default]
    Empty,
    Null(ViewKind),
    ShaderResource {
        resource: u64,
        range: SubresourceRange,
        format: Format,
    },
    UnorderedAccess {
        resource: u64,
        range: SubresourceRange,
        format: Format,
    },
    ConstantBuffer {
        resource: u64,
        offset: u64,
        size: u32,
    },
    RenderTarget {
        resource: u64,
        mip: u32,
        layer: u32,
    },
    DepthStencil {
        resource: u64,
        mip: u32,
        layer: u32,
        read_only: bool,
    },
    Sampler(SamplerDescriptor),
}

impl DescriptorContents {
    pub(super) fn from_view(view: &ViewDescriptor<'_, super::Api>) -> Self {
        match *view {
            ViewDescriptor::ShaderResource {
                resource,
                range,
                format,
            } => Self::ShaderResource {
                resource: resource.id,
                range,
                format,
            },
            ViewDescriptor::UnorderedAccess {
                resource,
                range,
                format,
            } => Self::UnorderedAccess {
                resource: resource.id,
                range,
                format,
            },
            ViewDescriptor::ConstantBuffer {
                resource,
                offset,
                size,
            } => Self::ConstantBuffer {
                resource: resource.id,
                offset,
                size,
            },
            ViewDescriptor::RenderTarget {
                resource,
                mip,
                layer,
                format: _,
            } => Self::RenderTarget {
                resource: resource.id,
                mip,
                layer,
            },
            ViewDescriptor::DepthStencil {
                resource,
                mip,
                layer,
                format: _,
                read_only,
            } => Self::DepthStencil {
                resource: resource.id,
                mip,
                layer,
                read_only,
            },
            ViewDescriptor::Sampler(desc) => Self::Sampler(desc),
            ViewDescriptor::Null(kind) => Self::Null(kind),
        }
    }

    /// The id of the resource the descriptor refers to.
    pub fn resource(&self) -> Option<u64> {
        match *self {
            Self::ShaderResource { resource, .. }
            | Self::UnorderedAccess { resource, .. }
            | Self::ConstantBuffer { resource, .. }
            | Self::RenderTarget { resource, .. }
            | Self::DepthStencil { resource, .. } => Some(resource),
            Self::Empty | Self::Null(_) | Self::Sampler(_) => None,
        }
    }

    pub fn sampler_compare(&self) -> Option<CompareFunction> {
        match *self {
            Self::Sampler(ref desc) => desc.compare,
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(super) struct HeapStorage {
    pub(super) id: u32,
    pub(super) ty: DescriptorHeapType,
    pub(super) shader_visible: bool,
    pub(super) slots: Mutex<Vec<DescriptorContents>>,
}

impl HeapStorage {
    pub(super) fn cpu_start(&self) -> CpuDescriptor {
        CpuDescriptor {
            ptr: u64::from(self.id) << HEAP_ID_SHIFT,
        }
    }

    pub(super) fn gpu_start(&self) -> GpuDescriptor {
        GpuDescriptor {
            ptr: GPU_HANDLE_BIT | u64::from(self.id) << HEAP_ID_SHIFT,
        }
    }
}

#[derive(Debug)]
pub struct DescriptorHeap {
    pub(super) storage: Arc<HeapStorage>,
}

impl DescriptorHeap {
    pub fn id(&self) -> u32 {
        self.storage.id
    }

    pub fn ty(&self) -> DescriptorHeapType {
        self.storage.ty
    }

    pub fn capacity(&self) -> u32 {
        self.storage.slots.lock().len() as u32
    }
}

/// Splits a handle into the heap id and the slot index.
pub(super) fn decode(ptr: u64, ty_of: impl Fn(u32) -> Option<DescriptorHeapType>) -> Option<(u32, u32)> {
    let ptr = ptr & !GPU_HANDLE_BIT;
    let heap = (ptr >> HEAP_ID_SHIFT) as u32;
    let offset = (ptr & u64::from(u32::MAX)) as u32;
    let ty = ty_of(heap)?;
    let increment = increment(ty);
    if offset % increment != 0 {
        return None;
    }
    Some((heap, offset / increment))
}

#[derive(Debug, Default)]
pub(super) struct HeapRegistry {
    heaps: Mutex<Vec<Arc<HeapStorage>>>,
}

impl HeapRegistry {
    pub(super) fn create(
        &self,
        ty: DescriptorHeapType,
        count: u32,
        shader_visible: bool,
    ) -> Arc<HeapStorage> {
        let mut heaps = self.heaps.lock();
        let storage = Arc::new(HeapStorage {
            // Heap 0 is never handed out, so a zero handle is always invalid.
            id: heaps.len() as u32 + 1,
            ty,
            shader_visible,
            slots: Mutex::new(vec![DescriptorContents::Empty; count as usize]),
        });
        heaps.push(Arc::clone(&storage));
        storage
    }

    pub(super) fn get(&self, id: u32) -> Option<Arc<HeapStorage>> {
        let index = id.checked_sub(1)?;
        self.heaps.lock().get(index as usize).cloned()
    }

    /// Looks up the heap and slot a handle points at.
    pub(super) fn resolve(&self, ptr: u64) -> Option<(Arc<HeapStorage>, u32)> {
        let heaps = self.heaps.lock();
        let lookup = |id: u32| -> Option<&Arc<HeapStorage>> {
            id.checked_sub(1).and_then(|i| heaps.get(i as usize))
        };
        let (id, index) = decode(ptr, |id| lookup(id).map(|heap| heap.ty))?;
        let heap = Arc::clone(lookup(id)?);
        Some((heap, index))
    }
}
