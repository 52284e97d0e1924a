use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use arrayvec::ArrayVec;
use hal::{DescriptorHeapType, Device as _, GpuDescriptor, MAX_SAMPLERS};
use parking_lot::Mutex;

use super::GlobalOnlineHeap;
use crate::{
    hal_api::HalApi,
    resource::{Sampler, TrackerId},
    resource_log, FastHashMap,
};

/// Identifies a sampler table by the samplers in its slots.
pub type SamplerTableKey = ArrayVec<TrackerId, MAX_SAMPLERS>;

/// A sampler table that was copied into a context-local heap because the
/// global heap did not have it yet.
pub struct UniqueSamplerTable<A: HalApi> {
    samplers: ArrayVec<Arc<Sampler<A>>, MAX_SAMPLERS>,
}

impl<A: HalApi> UniqueSamplerTable<A> {
    pub fn new(samplers: ArrayVec<Arc<Sampler<A>>, MAX_SAMPLERS>) -> Self {
        Self { samplers }
    }

    pub fn key(&self) -> SamplerTableKey {
        self.samplers.iter().map(|sampler| sampler.id()).collect()
    }
}

/// Sampler tables that live in the global sampler heap for the lifetime of
/// the device.
///
/// A context looks its tables up here first. On a miss it copies the table
/// into its own sampler heap and records it, and the recorded tables are
/// consolidated into the global heap when the command list closes. The
/// global heap never rolls over, so once it is full no more tables are
/// added.
pub struct GlobalSamplerTableCache<A: HalApi> {
    heap: Arc<GlobalOnlineHeap<A>>,
    tables: Mutex<FastHashMap<SamplerTableKey, GpuDescriptor>>,
    full: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<A: HalApi> GlobalSamplerTableCache<A> {
    pub fn new(heap: Arc<GlobalOnlineHeap<A>>) -> Self {
        Self {
            heap,
            tables: Mutex::new(FastHashMap::default()),
            full: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn heap(&self) -> &Arc<GlobalOnlineHeap<A>> {
        &self.heap
    }

    pub fn find(&self, key: &[TrackerId]) -> Option<GpuDescriptor> {
        let found = self.tables.lock().get(key).copied();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Copies `tables` into the global heap. Returns how many were added.
    pub fn consolidate(
        &self,
        device: &A::Device,
        tables: impl IntoIterator<Item = UniqueSamplerTable<A>>,
    ) -> usize {
        if self.full.load(Ordering::Acquire) {
            return 0;
        }
        let mut added = 0;
        let mut map = self.tables.lock();
        for table in tables {
            let key = table.key();
            if key.is_empty() || map.contains_key(&key) {
                continue;
            }
            let count = key.len() as u32;
            let Some(slot) = self.heap.try_reserve(count) else {
                if !self.full.swap(true, Ordering::AcqRel) {
                    log::warn!(
                        "Global sampler heap is full after {} tables; \
                         further sampler tables stay in context heaps",
                        map.len()
                    );
                }
                break;
            };
            let sources: ArrayVec<_, MAX_SAMPLERS> =
                table.samplers.iter().map(|sampler| sampler.descriptor()).collect();
            device.copy_descriptors(
                self.heap.cpu_handle(slot),
                &sources,
                DescriptorHeapType::Sampler,
            );
            map.insert(key, self.heap.gpu_handle(slot));
            added += 1;
        }
        if added != 0 {
            resource_log!("Consolidated {added} sampler tables into the global heap");
        }
        added
    }

    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Lookups that found / did not find a table.
    pub fn hit_miss_counts(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl<A: HalApi> fmt::Debug for GlobalSamplerTableCache<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalSamplerTableCache")
            .field("tables", &self.len())
            .field("full", &self.is_full())
            .finish()
    }
}
