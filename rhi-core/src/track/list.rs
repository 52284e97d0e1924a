use std::{fmt, sync::Arc};

use hal::{ResourceStates, Subresource, SubresourceRange};

use super::{transition_target, SubresourceStates, TrackedState};
use crate::{
    command::BarrierBatcher,
    hal_api::HalApi,
    resource::{Resource, TrackerId},
    FastHashMap,
};

/// A transition recorded before the command list knew the state of the
/// subresource. Resolved when the list is executed.
pub struct PendingTransition<A: HalApi> {
    pub resource: Arc<Resource<A>>,
    pub subresource: Subresource,
    pub after: ResourceStates,
}

impl<A: HalApi> fmt::Debug for PendingTransition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PendingTransition({} {:?} -> {:?})",
            self.resource.id(),
            self.subresource,
            self.after
        )
    }
}

struct TrackedResource<A: HalApi> {
    resource: Arc<Resource<A>>,
    states: SubresourceStates<TrackedState>,
}

/// The states of the resources used by one command list.
pub struct CommandListTracker<A: HalApi> {
    resources: FastHashMap<TrackerId, TrackedResource<A>>,
    pending: Vec<PendingTransition<A>>,
}

impl<A: HalApi> CommandListTracker<A> {
    pub fn new() -> Self {
        Self {
            resources: FastHashMap::default(),
            pending: Vec::new(),
        }
    }

    /// Transitions `range` of `resource` (all of it when `None`) to `after`.
    ///
    /// Barriers whose before state is known are added to `barriers`. The
    /// others are kept until [`CommandListTracker::resolve`].
    pub fn transition(
        &mut self,
        resource: &Arc<Resource<A>>,
        range: Option<&SubresourceRange>,
        after: ResourceStates,
        barriers: &mut BarrierBatcher<A>,
    ) {
        if !resource.requires_tracking() {
            return;
        }
        let count = resource.subresource_count();
        let Self {
            ref mut resources,
            ref mut pending,
        } = *self;
        let tracked = resources
            .entry(resource.id())
            .or_insert_with(|| TrackedResource {
                resource: Arc::clone(resource),
                states: SubresourceStates::new(count, TrackedState::Unknown),
            });

        let whole = range.map_or(true, |range| range.mip_count * range.layer_count >= count);
        match (whole, tracked.states.uniform()) {
            (true, Some(current)) => {
                transition_one(pending, tracked, Subresource::All, current, after, barriers);
            }
            (true, None) => {
                for index in 0..count {
                    let current = tracked.states.get(index);
                    let sub = Subresource::Index(index);
                    transition_one(pending, tracked, sub, current, after, barriers);
                }
            }
            (false, _) => {
                let Some(range) = range else { return };
                for index in range.indices(resource.mip_level_count()) {
                    let current = tracked.states.get(index);
                    let sub = Subresource::Index(index);
                    transition_one(pending, tracked, sub, current, after, barriers);
                }
            }
        }
    }

    /// Orders unordered-access work on `resource` before what follows.
    pub fn uav_barrier(&mut self, resource: &Arc<Resource<A>>, barriers: &mut BarrierBatcher<A>) {
        barriers.add_uav(resource);
    }

    /// The state of `subresource` as this list will leave it, if the list
    /// used it.
    pub fn state(&self, resource: &Resource<A>, subresource: u32) -> Option<TrackedState> {
        self.resources
            .get(&resource.id())
            .map(|tracked| tracked.states.get(subresource))
    }

    pub fn pending(&self) -> &[PendingTransition<A>] {
        &self.pending
    }

    /// Number of distinct resources used.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resolves pending transitions against the states resources will have
    /// when this list starts executing, then makes this list's final states
    /// the resources' states.
    ///
    /// Must be called in execution order. A pending transition resolves to a
    /// barrier only when the state differs, and always ends in exactly the
    /// state this list recorded against. Returns the number of pending
    /// transitions.
    pub fn resolve(&mut self, barriers: &mut BarrierBatcher<A>) -> usize {
        let count = self.pending.len();
        for pending in self.pending.drain(..) {
            let Some(mut global) = pending.resource.tracked_states() else {
                continue;
            };
            let mut emit = |subresource, before: ResourceStates| {
                if before != pending.after {
                    barriers.add_transition(&pending.resource, subresource, before, pending.after);
                }
            };
            match (pending.subresource, global.uniform()) {
                (Subresource::All, Some(before)) => emit(Subresource::All, before),
                (Subresource::All, None) => {
                    for (index, before) in global.iter() {
                        emit(Subresource::Index(index), before);
                    }
                }
                (Subresource::Index(index), _) => {
                    emit(Subresource::Index(index), global.get(index));
                }
            }
            global.set(pending.subresource, pending.after);
        }

        for tracked in self.resources.values() {
            let Some(mut global) = tracked.resource.tracked_states() else {
                continue;
            };
            match tracked.states.uniform() {
                Some(TrackedState::Known(state)) => global.set(Subresource::All, state),
                Some(TrackedState::Unknown) => {}
                None => {
                    for (index, state) in tracked.states.iter() {
                        if let TrackedState::Known(state) = state {
                            global.set(Subresource::Index(index), state);
                        }
                    }
                }
            }
        }
        self.resources.clear();
        count
    }

    pub fn clear(&mut self) {
        self.resources.clear();
        self.pending.clear();
    }
}

fn transition_one<A: HalApi>(
    pending: &mut Vec<PendingTransition<A>>,
    tracked: &mut TrackedResource<A>,
    subresource: Subresource,
    current: TrackedState,
    after: ResourceStates,
    barriers: &mut BarrierBatcher<A>,
) {
    match current {
        TrackedState::Unknown => {
            pending.push(PendingTransition {
                resource: Arc::clone(&tracked.resource),
                subresource,
                after,
            });
            tracked.states.set(subresource, TrackedState::Known(after));
        }
        TrackedState::Known(before) => {
            if let Some(target) = transition_target(before, after) {
                barriers.add_transition(&tracked.resource, subresource, before, target);
                tracked.states.set(subresource, TrackedState::Known(target));
            }
        }
    }
}

impl<A: HalApi> Default for CommandListTracker<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: HalApi> fmt::Debug for CommandListTracker<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandListTracker")
            .field("resources", &self.resources.len())
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hal::{
        api::Soft,
        soft::{self, ExecutionMode},
        Device as _, Format, HeapKind, ResourceDescriptor, ResourceDimension,
    };

    const PSR: ResourceStates = ResourceStates::PIXEL_SHADER_RESOURCE;
    const RT: ResourceStates = ResourceStates::RENDER_TARGET;

    fn texture(device: &soft::Device, mips: u16, initial: ResourceStates) -> Arc<Resource<Soft>> {
        let desc = ResourceDescriptor {
            label: Some("texture"),
            dimension: ResourceDimension::Texture2D,
            width: 64,
            height: 64,
            depth_or_array_size: 1,
            mip_levels: mips,
            format: Format::R8G8B8A8Unorm,
            heap: HeapKind::Default,
            initial_state: initial,
        };
        let raw = device.create_resource(&desc).unwrap();
        Arc::new(Resource::new(raw, &desc, 0))
    }

    #[test]
    fn first_use_is_pending_and_later_uses_are_barriers() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let resource = texture(&device, 1, ResourceStates::COMMON);
        let mut tracker = CommandListTracker::new();
        let mut barriers = BarrierBatcher::new();

        tracker.transition(&resource, None, RT, &mut barriers);
        assert!(barriers.is_empty());
        assert_eq!(tracker.pending().len(), 1);
        assert_eq!(tracker.state(&resource, 0), Some(TrackedState::Known(RT)));

        tracker.transition(&resource, None, RT, &mut barriers);
        assert!(barriers.is_empty());
        tracker.transition(&resource, None, PSR, &mut barriers);
        assert_eq!(barriers.len(), 1);
        assert_eq!(tracker.pending().len(), 1);
    }

    #[test]
    fn depth_write_is_kept_for_depth_reads() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let resource = texture(&device, 1, ResourceStates::COMMON);
        let mut tracker = CommandListTracker::new();
        let mut barriers = BarrierBatcher::new();

        tracker.transition(&resource, None, ResourceStates::DEPTH_WRITE, &mut barriers);
        tracker.transition(&resource, None, ResourceStates::DEPTH_READ, &mut barriers);
        assert!(barriers.is_empty());
        assert_eq!(
            tracker.state(&resource, 0),
            Some(TrackedState::Known(ResourceStates::DEPTH_WRITE))
        );
    }

    #[test]
    fn resolve_emits_only_needed_barriers_and_publishes() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let already_rt = texture(&device, 1, RT);
        let common = texture(&device, 1, ResourceStates::COMMON);
        let mut tracker = CommandListTracker::new();
        let mut recorded = BarrierBatcher::new();

        tracker.transition(&already_rt, None, RT, &mut recorded);
        tracker.transition(&common, None, RT, &mut recorded);
        tracker.transition(&common, None, PSR, &mut recorded);
        assert_eq!(recorded.len(), 1);

        let mut resolved = BarrierBatcher::new();
        assert_eq!(tracker.resolve(&mut resolved), 2);
        assert_eq!(resolved.len(), 1);
        assert!(tracker.is_empty());
        assert_eq!(already_rt.uniform_state(), Some(RT));
        assert_eq!(common.uniform_state(), Some(PSR));
    }

    #[test]
    fn subresource_ranges_split_and_collapse() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let resource = texture(&device, 3, ResourceStates::COMMON);
        let mut tracker = CommandListTracker::new();
        let mut barriers = BarrierBatcher::new();

        tracker.transition(&resource, Some(&SubresourceRange::single(1, 0)), RT, &mut barriers);
        assert_eq!(tracker.state(&resource, 0), Some(TrackedState::Unknown));
        assert_eq!(tracker.state(&resource, 1), Some(TrackedState::Known(RT)));

        // Mip 1 is known, mips 0 and 2 become pending.
        tracker.transition(&resource, None, PSR, &mut barriers);
        assert_eq!(barriers.len(), 1);
        assert_eq!(tracker.pending().len(), 3);
        assert_eq!(tracker.state(&resource, 2), Some(TrackedState::Known(PSR)));

        let mut resolved = BarrierBatcher::new();
        tracker.resolve(&mut resolved);
        // The COMMON -> RT of mip 1, then COMMON -> PSR for mips 0 and 2.
        assert_eq!(resolved.len(), 3);
        assert_eq!(resource.uniform_state(), Some(PSR));
    }

    #[test]
    fn cpu_visible_resources_are_not_tracked() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let desc = ResourceDescriptor::buffer(Some("upload"), 64, HeapKind::Upload);
        let raw = device.create_resource(&desc).unwrap();
        let upload = Arc::new(Resource::<Soft>::new(raw, &desc, 0));
        let mut tracker = CommandListTracker::new();
        let mut barriers = BarrierBatcher::new();

        tracker.transition(
            &upload,
            None,
            ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
            &mut barriers,
        );
        assert!(tracker.is_empty());
        assert!(barriers.is_empty());
        assert_eq!(upload.uniform_state(), Some(ResourceStates::GENERIC_READ));
    }
}
