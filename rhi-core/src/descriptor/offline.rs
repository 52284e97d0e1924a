use std::{fmt, ops::Range, sync::Arc};

use hal::{CpuDescriptor, DescriptorHeapType, Device as _};
use parking_lot::Mutex;

use crate::{device::DeviceError, fatal, hal_api::HalApi, resource_log};

struct Page<A: HalApi> {
    /// Keeps the descriptors alive; never bound.
    _heap: A::DescriptorHeap,
    start: CpuDescriptor,
    /// Free slot ranges, sorted and never adjacent.
    free: Vec<Range<u32>>,
}

/// Allocates single CPU-only descriptors of one heap type.
///
/// Descriptors live in fixed-size pages that are never released. Each page
/// keeps a sorted list of free ranges, and freeing merges neighbours back
/// together.
pub struct OfflineDescriptorManager<A: HalApi> {
    ty: DescriptorHeapType,
    page_size: u32,
    increment: u32,
    pages: Mutex<Vec<Page<A>>>,
}

impl<A: HalApi> OfflineDescriptorManager<A> {
    pub fn new(device: &A::Device, ty: DescriptorHeapType, page_size: u32) -> Self {
        Self {
            ty,
            page_size: page_size.max(1),
            increment: device.descriptor_increment(ty),
            pages: Mutex::new(Vec::new()),
        }
    }

    pub fn ty(&self) -> DescriptorHeapType {
        self.ty
    }

    pub fn allocate(self: &Arc<Self>, device: &A::Device) -> Result<OfflineDescriptor<A>, DeviceError> {
        let mut pages = self.pages.lock();
        let found = pages
            .iter()
            .position(|page| !page.free.is_empty());
        let page_index = match found {
            Some(index) => index,
            None => {
                let heap = device.create_descriptor_heap(&hal::DescriptorHeapDescriptor {
                    label: Some("offline descriptors"),
                    ty: self.ty,
                    count: self.page_size,
                    shader_visible: false,
                })?;
                resource_log!(
                    "Offline {:?} descriptor page {} created",
                    self.ty,
                    pages.len()
                );
                pages.push(Page {
                    start: device.heap_cpu_start(&heap),
                    _heap: heap,
                    free: vec![0..self.page_size],
                });
                pages.len() - 1
            }
        };

        let page = &mut pages[page_index];
        let range = &mut page.free[0];
        let index = range.start;
        range.start += 1;
        if range.is_empty() {
            page.free.remove(0);
        }
        Ok(OfflineDescriptor {
            handle: page.start.offset(index, self.increment),
            page: page_index as u32,
            index,
            manager: Arc::clone(self),
        })
    }

    fn free(&self, page_index: u32, index: u32) {
        let mut pages = self.pages.lock();
        let page = &mut pages[page_index as usize];
        // First range starting after the freed slot.
        let next = page.free.partition_point(|range| range.start <= index);
        if next > 0 && page.free[next - 1].end > index {
            fatal!("Offline {:?} descriptor {index} freed twice", self.ty);
        }
        let joins_prev = next > 0 && page.free[next - 1].end == index;
        let joins_next = next < page.free.len() && page.free[next].start == index + 1;
        match (joins_prev, joins_next) {
            (true, true) => {
                let end = page.free.remove(next).end;
                page.free[next - 1].end = end;
            }
            (true, false) => page.free[next - 1].end += 1,
            (false, true) => page.free[next].start -= 1,
            (false, false) => page.free.insert(next, index..index + 1),
        }
    }

    /// Number of descriptors currently handed out.
    pub fn allocated(&self) -> u32 {
        let pages = self.pages.lock();
        let free: u32 = pages
            .iter()
            .flat_map(|page| page.free.iter())
            .map(|range| range.end - range.start)
            .sum();
        pages.len() as u32 * self.page_size - free
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl<A: HalApi> fmt::Debug for OfflineDescriptorManager<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineDescriptorManager")
            .field("ty", &self.ty)
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// A CPU-only descriptor, returned to its manager on drop.
pub struct OfflineDescriptor<A: HalApi> {
    handle: CpuDescriptor,
    page: u32,
    index: u32,
    manager: Arc<OfflineDescriptorManager<A>>,
}

impl<A: HalApi> OfflineDescriptor<A> {
    pub fn handle(&self) -> CpuDescriptor {
        self.handle
    }
}

impl<A: HalApi> Drop for OfflineDescriptor<A> {
    fn drop(&mut self) {
        self.manager.free(self.page, self.index);
    }
}

impl<A: HalApi> fmt::Debug for OfflineDescriptor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OfflineDescriptor({:?}: {:#x})", self.manager.ty, self.handle.ptr)
    }
}
