mod common;

use rt_renderer::backend::{
    BufferDesc, Command, FallbackBackend, FallbackOptions, HeapType, RaytracingBackend,
    ResourceState,
};

use common::session_with_latency;

#[test]
fn objects_retire_in_fence_order() {
    let session = session_with_latency(4);
    let context = session.context();

    let first = context.upload_data(&[1; 8], false).unwrap();
    let mut list = context.create_command_list_allocator_pair().unwrap();
    list.uav_barrier(&first);
    let first_fence = context.execute_command_list(list.close()).unwrap();
    drop(first);

    let second = context.upload_data(&[2; 8], false).unwrap();
    let mut list = context.create_command_list_allocator_pair().unwrap();
    list.uav_barrier(&second);
    let second_fence = context.execute_command_list(list.close()).unwrap();
    drop(second);

    // Both submissions are still queued, nothing may be freed.
    assert_eq!(context.completed_fence_value().unwrap(), 0);
    assert_eq!(context.clear_deferred_deletion_queue().unwrap(), 0);
    let pending = context.pending_deletions();
    assert_eq!(pending, 4);

    context.wait_for_fence(first_fence).unwrap();
    assert_eq!(context.clear_deferred_deletion_queue().unwrap(), 2);

    context.wait_for_fence(second_fence).unwrap();
    assert_eq!(context.clear_deferred_deletion_queue().unwrap(), 2);
    assert_eq!(context.pending_deletions(), 0);

    // The device survived every deletion.
    let list = context.create_command_list_allocator_pair().unwrap();
    context.execute_command_list(list.close()).unwrap();
}

#[test]
fn freeing_in_flight_memory_loses_the_device() {
    let mut backend = FallbackBackend::new(FallbackOptions { latency: 2 });
    let buffer = backend
        .create_buffer(&BufferDesc {
            label: "in flight".into(),
            size: 64,
            heap: HeapType::Default,
            initial_state: ResourceState::UnorderedAccess,
        })
        .unwrap();
    let allocator = backend.create_command_allocator().unwrap();
    backend
        .submit(
            allocator,
            &[Command::UavBarrier {
                resource: Some(buffer),
            }],
            1,
        )
        .unwrap();
    assert_eq!(backend.pending_submissions(), 1);

    backend.destroy_buffer(buffer);
    assert!(backend.is_device_lost());

    let allocator = backend.create_command_allocator();
    assert!(allocator.is_err());
}
