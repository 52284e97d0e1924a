/*! Command lists, their allocators, and submission.
 *
 * A [`CommandAllocator`] owns the memory commands are recorded into and may
 * only be reset once the GPU has finished every list recorded into it. The
 * [`CommandAllocatorManager`] recycles allocators in release order and
 * creates new ones while none is ready.
 *
 * A [`CommandList`] carries a pending sync point resolved at execution, and a
 * tracker of the resource states it changes. The [`CommandListManager`]
 * of a queue executes lists in batches, resolving each list's pending
 * transitions into a barrier list placed just before it.
!*/

mod allocator;
mod barrier;
mod list;
mod manager;

pub use allocator::{CommandAllocator, CommandAllocatorManager};
pub use barrier::BarrierBatcher;
pub use list::CommandList;
pub use manager::{CommandListManager, ExecuteError, ExecuteStats};
