use std::sync::Arc;

use hal::{CommandList as _, ResourceStates, Subresource};
use smallvec::SmallVec;

use crate::{hal_api::HalApi, resource::Resource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BarrierKind {
    Transition {
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    },
    Uav,
}

#[derive(Debug)]
struct BatchedBarrier<A: HalApi> {
    resource: Arc<Resource<A>>,
    kind: BarrierKind,
}

/// Barriers waiting to be recorded in a single call.
///
/// A transition that exactly undoes the previous batched one cancels it.
#[derive(Debug)]
pub struct BarrierBatcher<A: HalApi> {
    barriers: SmallVec<[BatchedBarrier<A>; 8]>,
}

impl<A: HalApi> BarrierBatcher<A> {
    pub fn new() -> Self {
        Self {
            barriers: SmallVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn add_transition(
        &mut self,
        resource: &Arc<Resource<A>>,
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    ) {
        if before == after {
            return;
        }
        if let Some(last) = self.barriers.last() {
            let undoes_last = Arc::ptr_eq(&last.resource, resource)
                && last.kind
                    == BarrierKind::Transition {
                        subresource,
                        before: after,
                        after: before,
                    };
            if undoes_last {
                self.barriers.pop();
                return;
            }
        }
        self.barriers.push(BatchedBarrier {
            resource: Arc::clone(resource),
            kind: BarrierKind::Transition {
                subresource,
                before,
                after,
            },
        });
    }

    pub fn add_uav(&mut self, resource: &Arc<Resource<A>>) {
        if let Some(last) = self.barriers.last() {
            if last.kind == BarrierKind::Uav && Arc::ptr_eq(&last.resource, resource) {
                return;
            }
        }
        self.barriers.push(BatchedBarrier {
            resource: Arc::clone(resource),
            kind: BarrierKind::Uav,
        });
    }

    /// Records every batched barrier into `list`. Returns how many there were.
    pub fn flush(&mut self, list: &mut A::CommandList) -> usize {
        let count = self.barriers.len();
        if count == 0 {
            return 0;
        }
        {
            let raw: SmallVec<[hal::Barrier<'_, A>; 8]> = self
                .barriers
                .iter()
                .map(|barrier| match barrier.kind {
                    BarrierKind::Transition {
                        subresource,
                        before,
                        after,
                    } => hal::Barrier::Transition {
                        resource: barrier.resource.raw(),
                        subresource,
                        before,
                        after,
                    },
                    BarrierKind::Uav => hal::Barrier::Uav {
                        resource: barrier.resource.raw(),
                    },
                })
                .collect();
            list.resource_barrier(&raw);
        }
        self.barriers.clear();
        count
    }
}

impl<A: HalApi> Default for BarrierBatcher<A> {
    fn default() -> Self {
        Self::new()
    }
}
