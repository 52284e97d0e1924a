/*! Recording entry points.
 *
 * A [`CommandContext`] owns one recording command list, the allocator it
 * records into, and a [`StateCache`]. Draws and dispatches apply the cached
 * state and then record the call. [`CommandContext::flush_commands`]
 * executes the list and opens a new one, keeping all bindings.
!*/

use std::{fmt, mem, sync::Arc};

use hal::{
    CommandList as _, IndexFormat, IndirectKind, PrimitiveTopology, QueueType, Rect,
    ResourceStates, SubresourceRange, Viewport, MAX_TEXTURE_DIMENSION_2D, VIEWPORT_BOUNDS_MAX,
};
use parking_lot::Mutex;

use crate::{
    api_log,
    command::{CommandAllocator, CommandList, CommandListManager, ExecuteError},
    device::{Device, DeviceError},
    fatal,
    fence::SyncPoint,
    hal_api::HalApi,
    resource::{Resource, View},
    state_cache::{ApplyStateError, StateCache},
};

/// How [`CommandContext::transition_resources`] changes resource states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionAccess {
    /// Readable by every shader stage, or as a read-only depth target.
    Readable,
    /// Writable as a render target, depth target or, for buffers, through
    /// unordered access.
    Writable,
    /// Orders unordered-access work without a state change.
    RwBarrier,
}

/// A point on one queue another queue can wait for.
///
/// Written by [`CommandContext::write_compute_fence`] and waited on by
/// [`CommandContext::wait_compute_fence`], usually from contexts on
/// different queues.
pub struct ComputeFence<A: HalApi> {
    label: String,
    written: Mutex<Option<SyncPoint<A>>>,
}

impl<A: HalApi> ComputeFence<A> {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            written: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_written(&self) -> bool {
        self.written.lock().is_some()
    }

    pub fn sync_point(&self) -> Option<SyncPoint<A>> {
        self.written.lock().clone()
    }

    /// Forgets the written sync point so the fence can be written again.
    pub fn reset(&self) {
        *self.written.lock() = None;
    }
}

impl<A: HalApi> fmt::Debug for ComputeFence<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeFence")
            .field("label", &self.label)
            .field("written", &*self.written.lock())
            .finish()
    }
}

/// Counts kept by a [`CommandContext`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub draws: u64,
    pub dispatches: u64,
    pub flushes: u64,
}

/// Number of vertices `primitives` primitives of `topology` take.
pub fn vertex_count(topology: PrimitiveTopology, primitives: u32) -> u32 {
    match topology {
        PrimitiveTopology::PointList => primitives,
        PrimitiveTopology::LineList => primitives * 2,
        PrimitiveTopology::LineStrip => primitives + 1,
        PrimitiveTopology::TriangleList => primitives * 3,
        PrimitiveTopology::TriangleStrip => primitives + 2,
        PrimitiveTopology::PatchList(points) => primitives * u32::from(points.get()),
    }
}

pub struct CommandContext<A: HalApi> {
    device: Arc<Device<A>>,
    ty: QueueType,
    allocator: CommandAllocator<A>,
    list: CommandList<A>,
    state: StateCache<A>,
    scissor_enabled: bool,
    stats: ContextStats,
}

impl<A: HalApi> CommandContext<A> {
    pub(crate) fn new(device: Arc<Device<A>>, ty: QueueType) -> Result<Self, DeviceError> {
        let (allocator, list) = Self::open_list(&device, ty)?;
        let mut state = StateCache::new(&device)?;
        state
            .descriptor_cache_mut()
            .set_current_command_list(list.sync_point());
        api_log!("Created {ty:?} context with command list {}", list.id());

        let mut context = Self {
            device,
            ty,
            allocator,
            list,
            state,
            scissor_enabled: false,
            stats: ContextStats::default(),
        };
        context.set_scissor_rect(false, 0, 0, 0, 0);
        Ok(context)
    }

    fn open_list(
        device: &Device<A>,
        ty: QueueType,
    ) -> Result<(CommandAllocator<A>, CommandList<A>), DeviceError> {
        let manager = device.queue(ty);
        let mut allocator = manager.obtain_allocator(device.raw())?;
        let list = manager.obtain_command_list(device.raw(), &mut allocator)?;
        Ok((allocator, list))
    }

    pub fn device(&self) -> &Arc<Device<A>> {
        &self.device
    }

    pub fn ty(&self) -> QueueType {
        self.ty
    }

    pub fn command_list(&self) -> &CommandList<A> {
        &self.list
    }

    pub fn state(&self) -> &StateCache<A> {
        &self.state
    }

    /// Direct access to the binding state, for setters without extra
    /// validation.
    pub fn state_mut(&mut self) -> &mut StateCache<A> {
        &mut self.state
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    // Fixed-function state

    /// Sets the viewport from its corners. A viewport with no area is
    /// ignored.
    pub fn set_viewport(
        &mut self,
        min_x: f32,
        min_y: f32,
        min_z: f32,
        max_x: f32,
        max_y: f32,
        max_z: f32,
    ) {
        let bound = VIEWPORT_BOUNDS_MAX as f32;
        if min_x > bound || min_y > bound || max_x > bound || max_y > bound {
            fatal!("Viewport ({min_x}, {min_y}) - ({max_x}, {max_y}) exceeds the bound of {bound}");
        }
        let viewport = Viewport {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
            min_depth: min_z,
            max_depth: max_z,
        };
        if viewport.width > 0.0 && viewport.height > 0.0 {
            self.state.set_viewport(&viewport);
        }
    }

    /// Restricts rendering to a rectangle, or lifts the restriction when
    /// `enable` is false.
    pub fn set_scissor_rect(&mut self, enable: bool, min_x: u32, min_y: u32, max_x: u32, max_y: u32) {
        let rect = if enable {
            Rect {
                left: min_x as i32,
                top: min_y as i32,
                right: max_x as i32,
                bottom: max_y as i32,
            }
        } else {
            Rect {
                left: 0,
                top: 0,
                right: MAX_TEXTURE_DIMENSION_2D as i32,
                bottom: MAX_TEXTURE_DIMENSION_2D as i32,
            }
        };
        self.scissor_enabled = enable;
        self.state.set_scissor_rect(&rect);
    }

    pub fn is_scissor_enabled(&self) -> bool {
        self.scissor_enabled
    }

    /// Binds render targets. When they change, the viewport is reset to
    /// cover the first target.
    pub fn set_render_targets(&mut self, colors: &[Arc<View<A>>], depth_stencil: Option<&Arc<View<A>>>) {
        for view in colors {
            if view.kind() != hal::ViewKind::RenderTarget {
                fatal!("{:?} view bound as a render target", view.kind());
            }
        }
        if let Some(view) = depth_stencil {
            if view.kind() != hal::ViewKind::DepthStencil {
                fatal!("{:?} view bound as a depth target", view.kind());
            }
        }
        if !self.state.set_render_targets(colors, depth_stencil) {
            return;
        }
        if let Some(first) = colors.first().or(depth_stencil) {
            let (width, height) = first.resource().mip_extent(first.range().base_mip);
            self.set_viewport(0.0, 0.0, 0.0, width as f32, height as f32, 1.0);
        }
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.state.set_primitive_topology(topology);
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        self.state.set_stencil_ref(reference);
    }

    pub fn set_blend_factor(&mut self, factor: [f32; 4]) {
        self.state.set_blend_factor(factor);
    }

    /// Binds `(buffer, offset)` stream output targets from slot 0.
    pub fn set_stream_out_targets(&mut self, targets: &[(Arc<Resource<A>>, u64)]) {
        self.state.set_stream_out_targets(targets);
    }

    // Draws and dispatches

    pub fn draw_primitive(&mut self, base_vertex: u32, primitives: u32, instances: u32) -> Result<(), ApplyStateError> {
        if primitives == 0 {
            return Ok(());
        }
        let Some(topology) = self.state.primitive_topology() else {
            fatal!("Draw without a primitive topology");
        };
        self.state.apply_state(&self.device, &mut self.list, false)?;
        self.list.raw_mut().draw_instanced(
            vertex_count(topology, primitives),
            instances.max(1),
            base_vertex,
            0,
        );
        self.stats.draws += 1;
        Ok(())
    }

    pub fn draw_indexed_primitive(
        &mut self,
        index_buffer: &Arc<Resource<A>>,
        format: IndexFormat,
        base_vertex: i32,
        first_instance: u32,
        start_index: u32,
        primitives: u32,
        instances: u32,
    ) -> Result<(), ApplyStateError> {
        if primitives == 0 {
            return Ok(());
        }
        let Some(topology) = self.state.primitive_topology() else {
            fatal!("Draw without a primitive topology");
        };
        self.state.set_index_buffer(Some(index_buffer), 0, format);
        self.state.apply_state(&self.device, &mut self.list, false)?;
        self.list.raw_mut().draw_indexed_instanced(
            vertex_count(topology, primitives),
            instances.max(1),
            start_index,
            base_vertex,
            first_instance,
        );
        self.stats.draws += 1;
        Ok(())
    }

    pub fn draw_primitive_indirect(
        &mut self,
        arguments: &Arc<Resource<A>>,
        offset: u64,
    ) -> Result<(), ApplyStateError> {
        self.list
            .transition_resource(arguments, None, ResourceStates::INDIRECT_ARGUMENT);
        self.state.apply_state(&self.device, &mut self.list, false)?;
        self.list
            .raw_mut()
            .execute_indirect(IndirectKind::Draw, arguments.raw(), offset);
        self.stats.draws += 1;
        Ok(())
    }

    pub fn draw_indexed_indirect(
        &mut self,
        index_buffer: &Arc<Resource<A>>,
        format: IndexFormat,
        arguments: &Arc<Resource<A>>,
        offset: u64,
    ) -> Result<(), ApplyStateError> {
        self.state.set_index_buffer(Some(index_buffer), 0, format);
        self.list
            .transition_resource(arguments, None, ResourceStates::INDIRECT_ARGUMENT);
        self.state.apply_state(&self.device, &mut self.list, false)?;
        self.list
            .raw_mut()
            .execute_indirect(IndirectKind::DrawIndexed, arguments.raw(), offset);
        self.stats.draws += 1;
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), ApplyStateError> {
        if x == 0 || y == 0 || z == 0 {
            return Ok(());
        }
        self.state.apply_state(&self.device, &mut self.list, true)?;
        self.list.raw_mut().dispatch(x, y, z);
        self.stats.dispatches += 1;
        Ok(())
    }

    pub fn dispatch_indirect(
        &mut self,
        arguments: &Arc<Resource<A>>,
        offset: u64,
    ) -> Result<(), ApplyStateError> {
        self.list
            .transition_resource(arguments, None, ResourceStates::INDIRECT_ARGUMENT);
        self.state.apply_state(&self.device, &mut self.list, true)?;
        self.list
            .raw_mut()
            .execute_indirect(IndirectKind::Dispatch, arguments.raw(), offset);
        self.stats.dispatches += 1;
        Ok(())
    }

    // Synchronization

    /// Transitions whole resources for the given kind of access.
    pub fn transition_resources(&mut self, access: TransitionAccess, resources: &[&Arc<Resource<A>>]) {
        for &resource in resources {
            let state = match access {
                TransitionAccess::RwBarrier => {
                    self.list.uav_barrier(resource);
                    continue;
                }
                TransitionAccess::Readable if resource.is_depth_stencil() => {
                    ResourceStates::DEPTH_READ
                        | ResourceStates::PIXEL_SHADER_RESOURCE
                        | ResourceStates::NON_PIXEL_SHADER_RESOURCE
                }
                TransitionAccess::Readable => {
                    ResourceStates::PIXEL_SHADER_RESOURCE
                        | ResourceStates::NON_PIXEL_SHADER_RESOURCE
                }
                TransitionAccess::Writable if resource.is_depth_stencil() => {
                    ResourceStates::DEPTH_WRITE
                }
                TransitionAccess::Writable if resource.is_buffer() => {
                    ResourceStates::UNORDERED_ACCESS
                }
                TransitionAccess::Writable => ResourceStates::RENDER_TARGET,
            };
            self.list.transition_resource(resource, None, state);
        }
    }

    /// Transitions part of a resource to an explicit state.
    pub fn transition_resource(
        &mut self,
        resource: &Arc<Resource<A>>,
        range: Option<&SubresourceRange>,
        after: ResourceStates,
    ) {
        self.list.transition_resource(resource, range, after);
    }

    pub fn uav_barrier(&mut self, resource: &Arc<Resource<A>>) {
        self.list.uav_barrier(resource);
    }

    /// Executes everything recorded so far and marks `fence` written with
    /// its sync point.
    pub fn write_compute_fence(&mut self, fence: &ComputeFence<A>) -> Result<(), ExecuteError> {
        if fence.is_written() {
            fatal!("Compute fence {:?} written twice", fence.label);
        }
        let sync_point = self.flush_commands()?;
        *fence.written.lock() = Some(sync_point);
        Ok(())
    }

    /// Makes later work of this context's queue wait for `fence`.
    pub fn wait_compute_fence(&mut self, fence: &ComputeFence<A>) -> Result<(), ExecuteError> {
        let Some(sync_point) = fence.sync_point() else {
            fatal!("Waited on compute fence {:?} before it was written", fence.label);
        };
        self.flush_commands()?;
        self.device.queue(self.ty).gpu_wait(&sync_point)?;
        Ok(())
    }

    /// Executes the current command list and starts a new one. Bindings are
    /// kept and recorded again into the new list.
    pub fn flush_commands(&mut self) -> Result<SyncPoint<A>, ExecuteError> {
        profiling::scope!("CommandContext::flush_commands");
        self.close_list()?;

        let (allocator, list) = Self::open_list(&self.device, self.ty)?;
        let executed = mem::replace(&mut self.list, list);
        let used_allocator = mem::replace(&mut self.allocator, allocator);
        let manager = self.device.queue(self.ty);
        let sync_point = manager.execute_command_lists(self.device.raw(), vec![executed]);
        Self::recycle_allocator(manager, used_allocator, &sync_point);

        self.state
            .descriptor_cache_mut()
            .set_current_command_list(self.list.sync_point());
        self.state.dirty_state();
        self.stats.flushes += 1;
        sync_point
    }

    /// Executes the current command list and gives the context up.
    pub fn finish(mut self) -> Result<SyncPoint<A>, ExecuteError> {
        self.close_list()?;
        let manager = self.device.queue(self.ty);
        let sync_point = manager.execute_command_lists(self.device.raw(), vec![self.list]);
        Self::recycle_allocator(manager, self.allocator, &sync_point);
        api_log!("Finished {:?} context after {:?}", self.ty, self.stats);
        sync_point
    }

    /// An allocator whose list failed to execute never becomes ready, so it
    /// is dropped instead of going back to the pool.
    fn recycle_allocator(
        manager: &CommandListManager<A>,
        allocator: CommandAllocator<A>,
        executed: &Result<SyncPoint<A>, ExecuteError>,
    ) {
        match *executed {
            Ok(_) => manager.release_allocator(allocator),
            Err(ref error) => {
                log::warn!("Dropping a {:?} command allocator after {error}", allocator.ty());
            }
        }
    }

    fn close_list(&mut self) -> Result<(), DeviceError> {
        self.list.close()?;
        let tables = self.state.descriptor_cache_mut().take_unique_sampler_tables();
        if !tables.is_empty() {
            let added = self
                .device
                .sampler_table_cache()
                .consolidate(self.device.raw(), tables);
            log::debug!("Consolidated {added} sampler tables into the global heap");
        }
        Ok(())
    }
}

impl<A: HalApi> fmt::Debug for CommandContext<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("ty", &self.ty)
            .field("list", &self.list)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::num::NonZeroU8;

    #[test]
    fn vertex_counts_follow_the_topology() {
        assert_eq!(vertex_count(PrimitiveTopology::PointList, 5), 5);
        assert_eq!(vertex_count(PrimitiveTopology::LineList, 5), 10);
        assert_eq!(vertex_count(PrimitiveTopology::LineStrip, 5), 6);
        assert_eq!(vertex_count(PrimitiveTopology::TriangleList, 5), 15);
        assert_eq!(vertex_count(PrimitiveTopology::TriangleStrip, 5), 7);
        let patches = PrimitiveTopology::PatchList(NonZeroU8::new(4).unwrap());
        assert_eq!(vertex_count(patches, 5), 20);
    }
}
