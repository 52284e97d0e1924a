mod common;

use std::sync::Arc;

use hal::{
    soft::{Command, ExecutionMode},
    FilterMode, Format, IndirectKind, PrimitiveTopology, QueueType, Rect, ResourceStates,
    SamplerDescriptor, ShaderStage, SubresourceRange,
};
use rhi_core::{
    config::ViewHeapMode,
    context::{ComputeFence, TransitionAccess},
    Settings,
};

fn count(commands: &[Command], matches: impl Fn(&Command) -> bool) -> usize {
    commands.iter().filter(|&command| matches(command)).count()
}

#[test]
fn draws_record_each_state_change_once() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let target = common::texture(&device, Format::R8G8B8A8Unorm, 256, 128, 2);
    let rtv = device.create_render_target_view(&target, 0, 0).unwrap();

    let mut context = device.create_context(QueueType::Direct).unwrap();
    let vertex = common::shader(ShaderStage::Vertex, 0, 1, 0, 0);
    let pixel = common::shader(ShaderStage::Pixel, 1, 0, 0, 1);
    context.state_mut().set_shader(ShaderStage::Vertex, Some(&vertex));
    context.state_mut().set_shader(ShaderStage::Pixel, Some(&pixel));
    context.set_render_targets(&[Arc::clone(&rtv)], None);
    context.set_primitive_topology(PrimitiveTopology::TriangleList);

    context.draw_primitive(0, 2, 1).unwrap();
    context.set_render_targets(&[Arc::clone(&rtv)], None);
    context.draw_primitive(6, 2, 1).unwrap();

    let commands = context.command_list().raw().commands();
    assert_eq!(count(commands, |c| matches!(c, Command::SetPipelineState(_))), 1);
    assert_eq!(count(commands, |c| matches!(c, Command::SetRenderTargets { .. })), 1);
    assert_eq!(count(commands, |c| matches!(c, Command::SetDescriptorHeaps { .. })), 1);
    let viewports: Vec<_> = commands
        .iter()
        .filter_map(|command| match *command {
            Command::SetViewports(ref viewports) => Some(viewports.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(viewports.len(), 1);
    assert_eq!((viewports[0][0].width, viewports[0][0].height), (256.0, 128.0));
    let draws: Vec<_> = commands
        .iter()
        .filter_map(|command| match *command {
            Command::Draw {
                vertex_count,
                start_vertex,
                ..
            } => Some((vertex_count, start_vertex)),
            _ => None,
        })
        .collect();
    assert_eq!(draws, [(6, 0), (6, 6)]);
    assert_eq!(context.stats().draws, 2);

    let sync_point = context.finish().unwrap();
    sync_point.wait_for_completion().unwrap();
    assert_eq!(target.state(0), ResourceStates::RENDER_TARGET);
    assert_eq!(target.state(1), ResourceStates::COMMON);
}

#[test]
fn contexts_share_cached_pipelines() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let target = common::texture(&device, Format::R8G8B8A8Unorm, 64, 64, 1);
    let rtv = device.create_render_target_view(&target, 0, 0).unwrap();
    let vertex = common::shader(ShaderStage::Vertex, 1, 1, 0, 0);

    let mut pipelines = Vec::new();
    for _ in 0..2 {
        let mut context = device.create_context(QueueType::Direct).unwrap();
        context.state_mut().set_shader(ShaderStage::Vertex, Some(&vertex));
        context.set_render_targets(&[Arc::clone(&rtv)], None);
        context.set_primitive_topology(PrimitiveTopology::LineList);
        context.draw_primitive(0, 1, 1).unwrap();
        pipelines.push(Arc::clone(context.state().graphics_pipeline().unwrap()));
        context.finish().unwrap();
    }

    assert!(Arc::ptr_eq(&pipelines[0], &pipelines[1]));
    assert_eq!(device.raw().stats().pipelines, 1);
    assert_eq!(device.raw().stats().root_signatures, 1);
    assert_eq!(device.pipelines().hit_miss_counts(), (1, 1));
}

#[test]
fn scissor_starts_disabled_and_empty_viewports_are_ignored() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let mut context = device.create_context(QueueType::Direct).unwrap();

    assert!(!context.is_scissor_enabled());
    assert_eq!(
        context.state().scissor_rect(),
        Some(&Rect {
            left: 0,
            top: 0,
            right: 16384,
            bottom: 16384,
        })
    );
    context.set_scissor_rect(true, 8, 8, 24, 32);
    assert!(context.is_scissor_enabled());
    assert_eq!(
        context.state().scissor_rect(),
        Some(&Rect {
            left: 8,
            top: 8,
            right: 24,
            bottom: 32,
        })
    );

    context.set_viewport(0.0, 0.0, 0.0, 0.0, 10.0, 1.0);
    assert!(context.state().viewport().is_none());
    context.set_viewport(16.0, 0.0, 0.0, 80.0, 32.0, 1.0);
    let viewport = context.state().viewport().unwrap();
    assert_eq!((viewport.x, viewport.width, viewport.height), (16.0, 64.0, 32.0));
}

#[test]
#[should_panic(expected = "exceeds the bound")]
fn viewports_past_the_bounds_are_fatal() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let mut context = device.create_context(QueueType::Direct).unwrap();
    context.set_viewport(0.0, 0.0, 0.0, 40000.0, 16.0, 1.0);
}

#[test]
fn new_render_targets_reset_the_viewport() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let target = common::texture(&device, Format::R8G8B8A8Unorm, 256, 128, 3);
    let mip0 = device.create_render_target_view(&target, 0, 0).unwrap();
    let mip1 = device.create_render_target_view(&target, 1, 0).unwrap();
    let mut context = device.create_context(QueueType::Direct).unwrap();

    context.set_render_targets(&[mip0], None);
    assert_eq!(context.state().viewport().unwrap().width, 256.0);
    context.set_viewport(0.0, 0.0, 0.0, 16.0, 16.0, 1.0);
    context.set_render_targets(&[Arc::clone(&mip1)], None);
    let viewport = context.state().viewport().unwrap();
    assert_eq!((viewport.width, viewport.height), (128.0, 64.0));

    // Rebinding the same targets keeps a custom viewport.
    context.set_viewport(0.0, 0.0, 0.0, 16.0, 16.0, 1.0);
    context.set_render_targets(&[mip1], None);
    assert_eq!(context.state().viewport().unwrap().width, 16.0);
}

#[test]
fn sampler_tables_move_to_the_global_heap() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let target = common::texture(&device, Format::R8G8B8A8Unorm, 64, 64, 1);
    let rtv = device.create_render_target_view(&target, 0, 0).unwrap();
    let sampler = device
        .create_sampler(&SamplerDescriptor {
            filter: FilterMode::Point,
            ..SamplerDescriptor::default()
        })
        .unwrap();
    let vertex = common::shader(ShaderStage::Vertex, 0, 0, 0, 0);
    let pixel = common::shader(ShaderStage::Pixel, 1, 0, 0, 1);

    let mut global_after_draw = Vec::new();
    for _ in 0..2 {
        let mut context = device.create_context(QueueType::Direct).unwrap();
        context.state_mut().set_shader(ShaderStage::Vertex, Some(&vertex));
        context.state_mut().set_shader(ShaderStage::Pixel, Some(&pixel));
        context
            .state_mut()
            .set_sampler(ShaderStage::Pixel, 0, Some(&sampler));
        context.set_render_targets(&[Arc::clone(&rtv)], None);
        context.set_primitive_topology(PrimitiveTopology::TriangleStrip);
        context.draw_primitive(0, 2, 1).unwrap();
        global_after_draw.push(context.state().descriptor_cache().uses_global_samplers());
        context.finish().unwrap();
    }

    assert_eq!(global_after_draw, [false, true]);
    assert_eq!(device.sampler_table_cache().len(), 1);
    assert_eq!(device.sampler_table_cache().hit_miss_counts(), (1, 1));
}

#[test]
fn full_view_heaps_roll_over() {
    let settings = Settings {
        view_heap_mode: ViewHeapMode::ThreadLocal,
        local_view_heap_size: 8,
        ..Settings::default()
    };
    let device = common::device(ExecutionMode::Immediate, settings);
    let target = common::texture(&device, Format::R8G8B8A8Unorm, 64, 64, 1);
    let rtv = device.create_render_target_view(&target, 0, 0).unwrap();
    let views: Vec<_> = (0..2)
        .map(|_| {
            let buffer = common::buffer(&device, "input", 1024);
            device.create_shader_resource_view(&buffer, None).unwrap()
        })
        .collect();

    let mut context = device.create_context(QueueType::Direct).unwrap();
    let vertex = common::shader(ShaderStage::Vertex, 0, 0, 0, 0);
    let pixel = common::shader(ShaderStage::Pixel, 4, 0, 0, 0);
    context.state_mut().set_shader(ShaderStage::Vertex, Some(&vertex));
    context.state_mut().set_shader(ShaderStage::Pixel, Some(&pixel));
    context.set_render_targets(&[rtv], None);
    context.set_primitive_topology(PrimitiveTopology::PointList);

    for view in views.iter().cycle().take(3) {
        context
            .state_mut()
            .set_shader_resource_view(ShaderStage::Pixel, 0, Some(view));
        context.draw_primitive(0, 1, 1).unwrap();
    }
    assert_eq!(context.state().descriptor_cache().rollover_count(), 1);
    // Once at the first draw, once more after the rollover.
    assert_eq!(
        count(context.command_list().raw().commands(), |c| matches!(
            c,
            Command::SetDescriptorHeaps { .. }
        )),
        2
    );
    context.finish().unwrap().wait_for_completion().unwrap();
}

fn view_heaps_bound(commands: &[Command]) -> Vec<u32> {
    commands
        .iter()
        .filter_map(|command| match *command {
            Command::SetDescriptorHeaps { view_heap, .. } => Some(view_heap),
            _ => None,
        })
        .collect()
}

#[test]
fn exhausted_global_view_heaps_fall_back_to_local_heaps() {
    let settings = Settings {
        global_view_heap_size: 16,
        online_block_size: 16,
        local_view_heap_size: 64,
        ..Settings::default()
    };
    let device = common::device(ExecutionMode::Immediate, settings);
    let global = device.global_view_heap().raw().id();
    let target = common::texture(&device, Format::R8G8B8A8Unorm, 64, 64, 1);
    let rtv = device.create_render_target_view(&target, 0, 0).unwrap();
    let vertex = common::shader(ShaderStage::Vertex, 0, 0, 0, 0);
    let pixel = common::shader(ShaderStage::Pixel, 4, 0, 0, 0);

    // The first context takes the only block.
    let mut contexts: Vec<_> = (0..2)
        .map(|_| device.create_context(QueueType::Direct).unwrap())
        .collect();
    for context in contexts.iter_mut() {
        context.state_mut().set_shader(ShaderStage::Vertex, Some(&vertex));
        context.state_mut().set_shader(ShaderStage::Pixel, Some(&pixel));
        context.set_render_targets(&[Arc::clone(&rtv)], None);
        context.set_primitive_topology(PrimitiveTopology::PointList);
    }

    let mut heaps = Vec::new();
    for _ in 0..3 {
        for context in contexts.iter_mut() {
            context.draw_primitive(0, 1, 1).unwrap();
            heaps.extend(view_heaps_bound(context.command_list().raw().commands()));
            context.flush_commands().unwrap();
        }
    }

    assert_eq!(contexts[0].state().descriptor_cache().rollover_count(), 0);
    assert_eq!(contexts[1].state().descriptor_cache().rollover_count(), 1);
    // Three lists per context, alternating.
    assert_eq!(heaps.len(), 6);
    assert!(heaps.iter().step_by(2).all(|&heap| heap == global));
    assert!(heaps.iter().skip(1).step_by(2).all(|&heap| heap != global));
    assert_eq!(contexts[1].stats().draws, 3);
    for context in contexts {
        context.finish().unwrap().wait_for_completion().unwrap();
    }
}

#[test]
fn full_global_sampler_heaps_keep_tables_local() {
    let settings = Settings {
        global_sampler_heap_size: 2,
        ..Settings::default()
    };
    let device = common::device(ExecutionMode::Immediate, settings);
    let target = common::texture(&device, Format::R8G8B8A8Unorm, 64, 64, 1);
    let rtv = device.create_render_target_view(&target, 0, 0).unwrap();
    let samplers: Vec<_> = [FilterMode::Point, FilterMode::Linear, FilterMode::Anisotropic]
        .into_iter()
        .map(|filter| {
            device
                .create_sampler(&SamplerDescriptor {
                    filter,
                    ..SamplerDescriptor::default()
                })
                .unwrap()
        })
        .collect();
    let tables = [(0, 1), (1, 2), (0, 2)];
    let vertex = common::shader(ShaderStage::Vertex, 0, 0, 0, 0);
    let pixel = common::shader(ShaderStage::Pixel, 1, 0, 0, 2);

    let mut uses_global = Vec::new();
    for _ in 0..2 {
        let mut context = device.create_context(QueueType::Direct).unwrap();
        context.state_mut().set_shader(ShaderStage::Vertex, Some(&vertex));
        context.state_mut().set_shader(ShaderStage::Pixel, Some(&pixel));
        context.set_render_targets(&[Arc::clone(&rtv)], None);
        context.set_primitive_topology(PrimitiveTopology::TriangleList);
        for &(first, second) in tables.iter() {
            let state = context.state_mut();
            state.set_sampler(ShaderStage::Pixel, 0, Some(&samplers[first]));
            state.set_sampler(ShaderStage::Pixel, 1, Some(&samplers[second]));
            context.draw_primitive(0, 1, 1).unwrap();
            uses_global.push(context.state().descriptor_cache().uses_global_samplers());
        }
        assert_eq!(context.stats().draws, 3);
        context.finish().unwrap().wait_for_completion().unwrap();
    }

    // Only the first table fit, so the second context misses on its second
    // table and stays local for the rest of the list.
    assert!(device.sampler_table_cache().is_full());
    assert_eq!(device.sampler_table_cache().len(), 1);
    assert_eq!(uses_global, [false, false, false, true, false, false]);
}

#[test]
fn dropped_contexts_give_back_unsubmitted_blocks() {
    let settings = Settings {
        global_view_heap_size: 32,
        online_block_size: 16,
        ..Settings::default()
    };
    let device = common::device(ExecutionMode::Immediate, settings);
    let target = common::texture(&device, Format::R8G8B8A8Unorm, 64, 64, 1);
    let rtv = device.create_render_target_view(&target, 0, 0).unwrap();
    let vertex = common::shader(ShaderStage::Vertex, 0, 0, 0, 0);
    let pixel = common::shader(ShaderStage::Pixel, 2, 0, 0, 0);

    let mut contexts: Vec<_> = (0..2)
        .map(|_| device.create_context(QueueType::Direct).unwrap())
        .collect();
    for context in contexts.iter_mut() {
        context.state_mut().set_shader(ShaderStage::Vertex, Some(&vertex));
        context.state_mut().set_shader(ShaderStage::Pixel, Some(&pixel));
        context.set_render_targets(&[Arc::clone(&rtv)], None);
        context.set_primitive_topology(PrimitiveTopology::PointList);
        context.draw_primitive(0, 1, 1).unwrap();
    }
    assert_eq!(device.global_view_heap().free_block_count(), 0);

    let finished = contexts.pop().unwrap();
    drop(contexts);
    assert_eq!(device.global_view_heap().free_block_count(), 1);
    finished.finish().unwrap();
    device.wait_idle().unwrap();
    let global = device.global_view_heap();
    assert!(global.obtain_block().is_some());
    assert!(global.obtain_block().is_some());
}

#[test]
fn allocators_are_reused_only_after_the_gpu_is_done() {
    let device = common::device(ExecutionMode::Manual, Settings::default());
    let mut context = device.create_context(QueueType::Direct).unwrap();
    let before = device.raw().stats();

    let mut sync_points = Vec::new();
    for _ in 0..3 {
        sync_points.push(context.flush_commands().unwrap());
    }
    let stats = device.raw().stats();
    assert_eq!(stats.command_allocators - before.command_allocators, 3);
    assert_eq!(stats.allocator_resets, before.allocator_resets);
    assert!(sync_points.iter().all(|sync_point| !sync_point.is_complete()));

    device.raw().run_gpu();
    assert!(sync_points.iter().all(|sync_point| sync_point.is_complete()));
    context.flush_commands().unwrap();
    let stats = device.raw().stats();
    assert_eq!(stats.command_allocators - before.command_allocators, 3);
    assert_eq!(stats.allocator_resets - before.allocator_resets, 1);
    assert_eq!(context.stats().flushes, 4);
}

#[test]
fn compute_fences_order_queues() {
    let device = common::device(ExecutionMode::Manual, Settings::default());
    let output = common::buffer(&device, "output", 4096);
    let uav = device.create_unordered_access_view(&output, None).unwrap();
    let fence = ComputeFence::new("simulation");

    let mut compute = device.create_context(QueueType::Compute).unwrap();
    let shader = common::shader(ShaderStage::Compute, 0, 0, 1, 0);
    compute
        .state_mut()
        .set_shader(ShaderStage::Compute, Some(&shader));
    compute
        .state_mut()
        .set_unordered_access_view(ShaderStage::Compute, 0, Some(&uav));
    compute.dispatch(16, 1, 1).unwrap();
    compute.write_compute_fence(&fence).unwrap();
    assert!(fence.is_written());

    let mut direct = device.create_context(QueueType::Direct).unwrap();
    direct.wait_compute_fence(&fence).unwrap();
    let sync_point = direct.finish().unwrap();
    assert!(!sync_point.is_complete());
    assert!(device.raw().pending_gpu_work() > 0);

    sync_point.wait_for_completion().unwrap();
    assert!(fence.sync_point().unwrap().is_complete());
    assert_eq!(output.state(0), ResourceStates::UNORDERED_ACCESS);

    fence.reset();
    assert!(!fence.is_written());
    compute.finish().unwrap();
}

#[test]
#[should_panic(expected = "before it was written")]
fn waiting_on_an_unwritten_compute_fence_is_fatal() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let fence = ComputeFence::new("never written");
    let mut context = device.create_context(QueueType::Direct).unwrap();
    let _ = context.wait_compute_fence(&fence);
}

#[test]
fn indirect_arguments_are_transitioned() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let arguments = common::buffer(&device, "arguments", 64);
    let mut context = device.create_context(QueueType::Compute).unwrap();
    let shader = common::shader(ShaderStage::Compute, 1, 0, 0, 0);
    context
        .state_mut()
        .set_shader(ShaderStage::Compute, Some(&shader));

    context.dispatch_indirect(&arguments, 16).unwrap();
    let arguments_id = arguments.raw().id();
    assert!(context
        .command_list()
        .raw()
        .commands()
        .iter()
        .any(|command| *command
            == Command::ExecuteIndirect {
                kind: IndirectKind::Dispatch,
                arguments: arguments_id,
                offset: 16,
            }));

    context.finish().unwrap().wait_for_completion().unwrap();
    assert_eq!(arguments.state(0), ResourceStates::INDIRECT_ARGUMENT);
}

#[test]
fn empty_work_is_skipped() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let mut context = device.create_context(QueueType::Compute).unwrap();

    // Neither call reaches the pipeline, so nothing needs to be bound.
    context.dispatch(0, 4, 4).unwrap();
    context.draw_primitive(0, 0, 1).unwrap();
    assert_eq!(context.stats().dispatches, 0);
    assert_eq!(context.stats().draws, 0);
    assert!(context.command_list().raw().commands().is_empty());
}

#[test]
fn transitions_follow_the_access_kind() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let depth = common::texture(&device, Format::D32Float, 128, 128, 1);
    let color = common::texture(&device, Format::R8G8B8A8Unorm, 128, 128, 4);
    let buffer = common::buffer(&device, "scratch", 256);
    let mut context = device.create_context(QueueType::Direct).unwrap();

    context.transition_resources(TransitionAccess::Readable, &[&depth]);
    context.transition_resources(TransitionAccess::Writable, &[&color, &buffer]);
    context.transition_resource(
        &color,
        Some(&SubresourceRange::single(2, 0)),
        ResourceStates::COPY_SOURCE,
    );
    context.transition_resources(TransitionAccess::RwBarrier, &[&buffer]);
    context.finish().unwrap().wait_for_completion().unwrap();

    assert_eq!(
        depth.state(0),
        ResourceStates::DEPTH_READ
            | ResourceStates::PIXEL_SHADER_RESOURCE
            | ResourceStates::NON_PIXEL_SHADER_RESOURCE
    );
    assert_eq!(buffer.state(0), ResourceStates::UNORDERED_ACCESS);
    assert_eq!(color.state(0), ResourceStates::RENDER_TARGET);
    assert_eq!(color.state(2), ResourceStates::COPY_SOURCE);
    assert_eq!(color.uniform_state(), None);
}

#[test]
fn wait_idle_drains_every_queue() {
    let device = common::device(ExecutionMode::Manual, Settings::default());
    let direct = device.create_context(QueueType::Direct).unwrap();
    let copy = device.create_context(QueueType::Copy).unwrap();
    let sync_points = [direct.finish().unwrap(), copy.finish().unwrap()];
    assert!(sync_points.iter().all(|sync_point| !sync_point.is_complete()));

    device.wait_idle().unwrap();
    assert!(sync_points.iter().all(|sync_point| sync_point.is_complete()));
}
