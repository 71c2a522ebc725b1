mod common;

use std::collections::HashSet;

use rt_renderer::{
    backend::InstanceDesc,
    pipeline::{primary_ray_pipeline, PipelineState, HIT_GROUP_EXPORT},
    Scene,
};
use ultraviolet::Vec3;

use common::{session, triangle};

#[test]
fn every_geometry_gets_its_own_blas() {
    let session = session();
    let geometries: Vec<_> = (0..4)
        .map(|i| triangle(&session, &format!("tri {}", i), -(i as f32), Vec3::one()))
        .collect();

    let pointers: HashSet<_> = geometries.iter().map(|g| g.blas_pointer()).collect();
    assert_eq!(pointers.len(), geometries.len());
    assert!(pointers.iter().all(|pointer| !pointer.is_null()));

    let fences: Vec<_> = geometries.iter().map(|g| g.build_fence()).collect();
    assert!(fences.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn many_additions_cost_a_single_rebuild() {
    let session = session();
    let mut scene = Scene::new(&session);
    for i in 0..8 {
        scene.add_geometry(triangle(&session, "tri", -(i as f32), Vec3::one()));
    }
    assert_eq!(scene.rebuild_count(), 0);

    let first = scene.top_level_acceleration_structure().unwrap();
    assert_eq!(scene.rebuild_count(), 1);

    let submissions = session.context().submission_count();
    let second = scene.top_level_acceleration_structure().unwrap();
    assert_eq!(first, second);
    assert_eq!(scene.rebuild_count(), 1);
    assert_eq!(session.context().submission_count(), submissions);
}

#[test]
fn single_triangle_scene() {
    let session = session();
    let mut scene = Scene::new(&session);
    let geometry = triangle(&session, "single", 0.0, Vec3::one());
    scene.add_geometry(geometry.clone());
    assert!(scene.is_dirty());

    let tlas = scene.top_level_acceleration_structure().unwrap();
    assert!(!scene.is_dirty());
    assert!(!tlas.is_null());
    assert_eq!(scene.instance_count(), Some(1));

    let instances = scene.instance_descs();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].acceleration_structure(), geometry.blas_pointer());
    assert_eq!(instances[0].transform, InstanceDesc::IDENTITY_TRANSFORM);
    assert_eq!(instances[0].hit_group_contribution(), 0);

    // The build consumed exactly what was uploaded.
    session.context().wait_for_idle().unwrap();
    let buffer = scene.instance_buffer().unwrap();
    let size = std::mem::size_of::<InstanceDesc>() as u64;
    let bytes = session.context().read_buffer(buffer, 0, size).unwrap();
    let built: InstanceDesc = bytemuck::pod_read_unaligned(&bytes);
    assert_eq!(built.acceleration_structure(), geometry.blas_pointer());
    assert_eq!(built.mask(), 1);
    assert_eq!(built.instance_id(), 0);
    assert_eq!(built.hit_group_contribution(), 0);
    assert_eq!(built.transform, InstanceDesc::IDENTITY_TRANSFORM);
    assert!(session.context().read_buffer(buffer, size, 1).is_err());
}

#[test]
fn empty_scene_still_has_a_tlas() {
    let session = session();
    let mut scene = Scene::new(&session);
    let tlas = scene.top_level_acceleration_structure().unwrap();
    assert!(!tlas.is_null());
    assert_eq!(scene.instance_count(), Some(0));
}

#[test]
fn hit_group_table_has_one_record_per_geometry() {
    let session = session();
    let pipeline = PipelineState::new(session.context(), &primary_ray_pipeline(Vec::new())).unwrap();
    let mut scene = Scene::new(&session);
    for i in 0..3 {
        scene.add_geometry(triangle(&session, "tri", -(i as f32), Vec3::one()));
    }

    let table = scene.hit_group_table(&pipeline, HIT_GROUP_EXPORT).unwrap();
    assert_eq!(table.record_count(), 3);
    let start = table.region().start;

    // Unchanged membership reuses the table.
    let table = scene.hit_group_table(&pipeline, HIT_GROUP_EXPORT).unwrap();
    assert_eq!(table.region().start, start);

    scene.add_geometry(triangle(&session, "late", -5.0, Vec3::one()));
    let table = scene.hit_group_table(&pipeline, HIT_GROUP_EXPORT).unwrap();
    assert_eq!(table.record_count(), 4);
}

#[test]
fn hit_records_point_at_geometry_descriptor_tables() {
    let session = session();
    let pipeline = PipelineState::new(session.context(), &primary_ray_pipeline(Vec::new())).unwrap();
    let mut scene = Scene::new(&session);
    let geometry = triangle(&session, "tri", 0.0, Vec3::one());
    scene.add_geometry(geometry.clone());

    let table = scene.hit_group_table(&pipeline, HIT_GROUP_EXPORT).unwrap();
    let record = table.read_record(0).unwrap();
    let identifier = pipeline.shader_identifier(HIT_GROUP_EXPORT).unwrap();
    assert_eq!(&record[..32], &identifier.0[..]);
    let handle = u64::from_le_bytes(record[32..40].try_into().unwrap());
    assert_eq!(handle, geometry.descriptor_table().0);
}
