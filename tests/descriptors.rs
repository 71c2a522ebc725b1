mod common;

use std::collections::HashSet;

use rt_renderer::RenderError;

use common::session;

#[test]
fn allocated_slots_return_to_the_free_list() {
    let session = session();
    let descriptors = session.descriptors();
    let before: HashSet<_> = descriptors.free_indices().into_iter().collect();

    let allocated: Vec<_> = (0..16)
        .map(|_| descriptors.allocate_descriptor().unwrap())
        .collect();
    let indices: HashSet<_> = allocated.iter().map(|d| d.index()).collect();
    assert_eq!(indices.len(), 16);
    assert!(!indices.contains(&0));
    assert_eq!(descriptors.free_count(), before.len() - 16);

    for descriptor in allocated {
        descriptors.delete_descriptor(descriptor);
    }
    let after: HashSet<_> = descriptors.free_indices().into_iter().collect();
    assert_eq!(before, after);
}

#[test]
fn handles_are_derived_from_the_heap_start() {
    let session = session();
    let descriptors = session.descriptors();
    let descriptor = descriptors.allocate_descriptor().unwrap();
    let heap = descriptors.heap();
    assert_eq!(descriptor.gpu_handle(), heap.gpu_handle(descriptor.index()));
    assert_eq!(descriptor.cpu_handle(), heap.cpu_handle(descriptor.index()));
    assert_eq!(heap.index_of(descriptor.gpu_handle()), Some(descriptor.index()));
    descriptors.delete_descriptor(descriptor);
}

#[test]
fn buffer_descriptors_free_their_slot_after_the_fence() {
    let session = session();
    let descriptors = session.descriptors();
    let free = descriptors.free_count();

    let buffer = descriptors.allocate_raw_uav_buffer(64).unwrap();
    assert!(!buffer.wrapped_pointer().is_null());
    assert_eq!(descriptors.free_count(), free - 1);

    drop(buffer);
    session.context().wait_for_idle().unwrap();
    session.end_frame().unwrap();
    assert_eq!(descriptors.free_count(), free);
}

#[test]
fn exhausting_the_heap_is_reported() {
    let session = session();
    let descriptors = session.descriptors();
    let mut held = Vec::new();
    loop {
        match descriptors.allocate_descriptor() {
            Ok(descriptor) => held.push(descriptor),
            Err(RenderError::DescriptorHeapExhausted { capacity }) => {
                assert_eq!(capacity, descriptors.capacity());
                break;
            }
            Err(err) => panic!("unexpected error: {}", err),
        }
    }
    assert_eq!(held.len() as u32, descriptors.capacity() - 1);
    for descriptor in held {
        descriptors.delete_descriptor(descriptor);
    }
}
