mod offline;
mod online;
mod sampler_cache;

pub use offline::{OfflineDescriptor, OfflineDescriptorManager};
pub use online::{
    GlobalOnlineHeap, OnlineHeap, OnlineHeapBlock, SubAllocatedOnlineHeap, ThreadLocalOnlineHeap,
};
pub use sampler_cache::{GlobalSamplerTableCache, SamplerTableKey, UniqueSamplerTable};
