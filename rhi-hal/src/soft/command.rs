use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use crate::{
    Barrier, BindPoint, CpuDescriptor, DeviceError, GpuDescriptor, IndexBufferView, IndirectKind,
    PrimitiveTopology, QueueType, Rect, ResourceStates, StreamOutView, Subresource,
    VertexBufferView, Viewport,
};

use super::Api;

#[derive(Debug)]
pub struct CommandAllocator {
    pub(super) ty: QueueType,
    /// Number of submitted command lists recorded into this allocator that
    /// the GPU has not finished yet.
    pub(super) in_flight: Arc<AtomicU32>,
    pub(super) resets: u32,
}

impl CommandAllocator {
    pub fn ty(&self) -> QueueType {
        self.ty
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn reset_count(&self) -> u32 {
        self.resets
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierRecord {
    Transition {
        resource: u64,
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    },
    Uav {
        resource: u64,
    },
}

/// A recorded command, with backend objects named by their ids.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Barriers(Vec<BarrierRecord>),
    SetDescriptorHeaps {
        view_heap: u32,
        sampler_heap: u32,
    },
    SetRootSignature {
        bind_point: BindPoint,
        root_signature: u64,
    },
    SetRootDescriptorTable {
        bind_point: BindPoint,
        index: u32,
        base: GpuDescriptor,
    },
    SetPipelineState(u64),
    SetVertexBuffers {
        start_slot: u32,
        views: Vec<VertexBufferView>,
    },
    SetIndexBuffer(Option<IndexBufferView>),
    SetRenderTargets {
        color: Vec<CpuDescriptor>,
        depth_stencil: Option<CpuDescriptor>,
    },
    SetViewports(Vec<Viewport>),
    SetScissorRects(Vec<Rect>),
    SetPrimitiveTopology(PrimitiveTopology),
    SetBlendFactor([f32; 4]),
    SetStencilRef(u32),
    SetStreamOutTargets {
        start_slot: u32,
        views: Vec<StreamOutView>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch([u32; 3]),
    ExecuteIndirect {
        kind: IndirectKind,
        arguments: u64,
        offset: u64,
    },
}

#[derive(Debug)]
pub struct CommandList {
    pub(super) ty: QueueType,
    pub(super) label: Option<String>,
    pub(super) allocator: Arc<AtomicU32>,
    pub(super) recording: bool,
    pub(super) commands: Vec<Command>,
}

impl CommandList {
    pub fn ty(&self) -> QueueType {
        self.ty
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Commands recorded since the last reset.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn barriers(&self) -> impl Iterator<Item = &BarrierRecord> + '_ {
        self.commands.iter().flat_map(|command| match *command {
            Command::Barriers(ref barriers) => barriers.as_slice(),
            _ => &[],
        })
    }

    fn record(&mut self, command: Command) {
        if !self.recording {
            log::error!("Recording {command:?} into closed command list {:?}", self.label);
            panic!("command list is not recording");
        }
        self.commands.push(command);
    }
}

impl crate::CommandList for CommandList {
    type A = Api;

    fn reset(&mut self, allocator: &mut CommandAllocator) -> Result<(), DeviceError> {
        if self.recording {
            log::error!("Command list {:?} reset while recording", self.label);
            return Err(DeviceError::Unexpected);
        }
        if allocator.ty != self.ty {
            log::error!(
                "Command list {:?} of type {:?} reset with an allocator of type {:?}",
                self.label,
                self.ty,
                allocator.ty
            );
            return Err(DeviceError::Unexpected);
        }
        self.allocator = Arc::clone(&allocator.in_flight);
        self.commands.clear();
        self.recording = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.recording {
            log::error!("Command list {:?} closed twice", self.label);
            return Err(DeviceError::Unexpected);
        }
        self.recording = false;
        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[Barrier<'_, Api>]) {
        if barriers.is_empty() {
            return;
        }
        let records = barriers
            .iter()
            .map(|barrier| match *barrier {
                Barrier::Transition {
                    resource,
                    subresource,
                    before,
                    after,
                } => BarrierRecord::Transition {
                    resource: resource.id,
                    subresource,
                    before,
                    after,
                },
                Barrier::Uav { resource } => BarrierRecord::Uav {
                    resource: resource.id,
                },
            })
            .collect();
        self.record(Command::Barriers(records));
    }

    fn set_descriptor_heaps(
        &mut self,
        view_heap: &super::DescriptorHeap,
        sampler_heap: &super::DescriptorHeap,
    ) {
        self.record(Command::SetDescriptorHeaps {
            view_heap: view_heap.id(),
            sampler_heap: sampler_heap.id(),
        });
    }

    fn set_root_signature(&mut self, bind_point: BindPoint, root_signature: &super::RootSignature) {
        self.record(Command::SetRootSignature {
            bind_point,
            root_signature: root_signature.id,
        });
    }

    fn set_root_descriptor_table(&mut self, bind_point: BindPoint, index: u32, base: GpuDescriptor) {
        self.record(Command::SetRootDescriptorTable {
            bind_point,
            index,
            base,
        });
    }

    fn set_pipeline_state(&mut self, pipeline: &super::PipelineState) {
        self.record(Command::SetPipelineState(pipeline.id));
    }

    fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]) {
        self.record(Command::SetVertexBuffers {
            start_slot,
            views: views.to_vec(),
        });
    }

    fn set_index_buffer(&mut self, view: Option<&IndexBufferView>) {
        self.record(Command::SetIndexBuffer(view.copied()));
    }

    fn set_render_targets(&mut self, color: &[CpuDescriptor], depth_stencil: Option<CpuDescriptor>) {
        self.record(Command::SetRenderTargets {
            color: color.to_vec(),
            depth_stencil,
        });
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.record(Command::SetViewports(viewports.to_vec()));
    }

    fn set_scissor_rects(&mut self, rects: &[Rect]) {
        self.record(Command::SetScissorRects(rects.to_vec()));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.record(Command::SetPrimitiveTopology(topology));
    }

    fn set_blend_factor(&mut self, factor: [f32; 4]) {
        self.record(Command::SetBlendFactor(factor));
    }

    fn set_stencil_ref(&mut self, reference: u32) {
        self.record(Command::SetStencilRef(reference));
    }

    fn set_stream_output_targets(&mut self, start_slot: u32, views: &[StreamOutView]) {
        self.record(Command::SetStreamOutTargets {
            start_slot,
            views: views.to_vec(),
        });
    }

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.record(Command::Draw {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(Command::Dispatch([x, y, z]));
    }

    fn execute_indirect(&mut self, kind: IndirectKind, arguments: &super::Resource, offset: u64) {
        self.record(Command::ExecuteIndirect {
            kind,
            arguments: arguments.id,
            offset,
        });
    }
}
