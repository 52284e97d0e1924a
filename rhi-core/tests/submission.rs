mod common;

use hal::{soft::ExecutionMode, Format, QueueType, ResourceStates};
use rhi_core::{command::ExecuteError, Settings};

#[test]
fn pending_transitions_resolve_in_submission_order() {
    let settings = Settings {
        max_command_lists_per_batch: 1,
        ..Settings::default()
    };
    let device = common::device(ExecutionMode::Manual, settings);
    let texture = common::texture(&device, Format::R8G8B8A8Unorm, 64, 64, 1);
    let queue = device.queue(QueueType::Direct);

    let mut allocator = queue.obtain_allocator(device.raw()).unwrap();
    let mut first = queue.obtain_command_list(device.raw(), &mut allocator).unwrap();
    let mut second = queue.obtain_command_list(device.raw(), &mut allocator).unwrap();
    first.transition_resource(&texture, None, ResourceStates::RENDER_TARGET);
    second.transition_resource(&texture, None, ResourceStates::PIXEL_SHADER_RESOURCE);
    assert_eq!(first.tracker().pending().len(), 1);
    assert_eq!(second.tracker().pending().len(), 1);
    first.close().unwrap();
    second.close().unwrap();

    let pending = [first.sync_point().clone(), second.sync_point().clone()];
    let before = queue.stats();
    let last = queue
        .execute_command_lists(device.raw(), vec![first, second])
        .unwrap();
    queue.release_allocator(allocator);

    let stats = queue.stats();
    assert_eq!(stats.submissions - before.submissions, 2);
    assert_eq!(stats.barrier_lists - before.barrier_lists, 2);
    let values: Vec<_> = pending
        .iter()
        .map(|sync_point| sync_point.get().unwrap().value())
        .collect();
    assert!(values[0] < values[1]);
    assert_eq!(values[1], last.value());
    assert_eq!(texture.state(0), ResourceStates::PIXEL_SHADER_RESOURCE);

    assert!(!pending[0].is_complete());
    last.wait_for_completion().unwrap();
    assert!(pending.iter().all(|sync_point| sync_point.is_complete()));
}

#[test]
fn copy_queues_reject_direct_lists() {
    let device = common::device(ExecutionMode::Immediate, Settings::default());
    let direct = device.queue(QueueType::Direct);
    let mut allocator = direct.obtain_allocator(device.raw()).unwrap();
    let mut list = direct
        .obtain_command_list(device.raw(), &mut allocator)
        .unwrap();
    list.close().unwrap();

    let result = device
        .queue(QueueType::Copy)
        .execute_command_lists(device.raw(), vec![list]);
    assert!(matches!(
        result,
        Err(ExecuteError::WrongQueue {
            list: QueueType::Direct,
            queue: QueueType::Copy,
        })
    ));
    direct.release_allocator(allocator);
}
