mod common;

use rt_renderer::{
    config_loader::Config,
    pipeline::primary_ray_pipeline,
    render::unpack_rgba8,
    scene::EnvironmentMap,
    Camera, CameraSettings, Light, RenderError, RenderSession, Renderer, Scene, Viewport,
};
use ultraviolet::Vec3;

use common::{session, triangle};

fn camera(viewport: Viewport) -> Camera {
    Camera::new(
        Vec3::new(0.0, 0.0, 2.0),
        Vec3::zero(),
        Vec3::unit_y(),
        CameraSettings::default(),
        viewport,
    )
}

fn pixel(pixels: &[u32], viewport: Viewport, x: u32, y: u32) -> [u8; 4] {
    unpack_rgba8(pixels[(y * viewport.width + x) as usize])
}

fn red_triangle_scene(session: &RenderSession) -> Scene {
    let mut scene = Scene::new(session);
    scene.add_geometry(triangle(session, "red", 0.0, Vec3::new(1.0, 0.0, 0.0)));
    scene.set_environment_map(EnvironmentMap {
        color: Vec3::new(0.0, 0.0, 1.0),
        texture: None,
    });
    scene
}

#[test]
fn unlit_frame_shows_material_and_environment() {
    let session = session();
    let viewport = Viewport::new(16, 12);
    let mut scene = red_triangle_scene(&session);
    let mut renderer =
        Renderer::new(&session, &primary_ray_pipeline(Vec::new()), viewport).unwrap();

    let stats = renderer.render(&mut scene, &camera(viewport)).unwrap();
    assert_eq!(stats.frame, 1);
    assert!(stats.tlas_rebuilt);
    assert_eq!(stats.geometry_count, 1);
    assert_eq!(stats.hit_group_records, 1);

    let pixels = renderer.read_output().unwrap();
    assert_eq!(pixels.len(), 16 * 12);
    assert_eq!(pixel(&pixels, viewport, 8, 6), [255, 0, 0, 255]);
    assert_eq!(pixel(&pixels, viewport, 0, 0), [0, 0, 255, 255]);
    assert_eq!(pixel(&pixels, viewport, 15, 11), [0, 0, 255, 255]);
}

#[test]
fn lights_add_to_the_ambient_term() {
    let session = session();
    let viewport = Viewport::new(16, 12);
    let mut scene = red_triangle_scene(&session);
    scene.add_light(Light::Directional {
        direction: Vec3::new(0.0, 0.0, -1.0),
        color: Vec3::one(),
        intensity: 0.5,
    });
    let mut renderer =
        Renderer::new(&session, &primary_ray_pipeline(Vec::new()), viewport).unwrap();

    renderer.render(&mut scene, &camera(viewport)).unwrap();
    let pixels = renderer.read_output().unwrap();
    // 0.1 ambient + 0.5 facing light
    assert_eq!(pixel(&pixels, viewport, 8, 6), [153, 0, 0, 255]);
    assert_eq!(pixel(&pixels, viewport, 0, 0), [0, 0, 255, 255]);
}

#[test]
fn the_top_row_is_the_top_of_the_image() {
    let session = session();
    let viewport = Viewport::new(32, 32);
    let mut scene = red_triangle_scene(&session);
    let mut renderer =
        Renderer::new(&session, &primary_ray_pipeline(Vec::new()), viewport).unwrap();
    renderer.render(&mut scene, &camera(viewport)).unwrap();
    let pixels = renderer.read_output().unwrap();

    let red_in_row = |y: u32| {
        (0..viewport.width)
            .filter(|&x| pixel(&pixels, viewport, x, y)[0] == 255)
            .count()
    };
    // The triangle's apex points up, so it is narrower above the center.
    assert!(red_in_row(12) < red_in_row(20));
}

#[test]
fn later_frames_reuse_the_tlas() {
    let session = session();
    let viewport = Viewport::new(8, 8);
    let mut scene = red_triangle_scene(&session);
    let mut renderer =
        Renderer::new(&session, &primary_ray_pipeline(Vec::new()), viewport).unwrap();
    let camera = camera(viewport);

    assert!(renderer.render(&mut scene, &camera).unwrap().tlas_rebuilt);
    let second = renderer.render(&mut scene, &camera).unwrap();
    assert!(!second.tlas_rebuilt);
    assert_eq!(second.frame, 2);
    assert_eq!(scene.rebuild_count(), 1);

    scene.add_geometry(triangle(&session, "behind", -1.0, Vec3::one()));
    let third = renderer.render(&mut scene, &camera).unwrap();
    assert!(third.tlas_rebuilt);
    assert_eq!(third.hit_group_records, 2);
}

#[test]
fn resize_changes_the_output() {
    let session = session();
    let mut scene = red_triangle_scene(&session);
    let mut renderer =
        Renderer::new(&session, &primary_ray_pipeline(Vec::new()), Viewport::new(8, 8)).unwrap();
    renderer.render(&mut scene, &camera(Viewport::new(8, 8))).unwrap();

    let viewport = Viewport::new(10, 6);
    renderer.resize(viewport).unwrap();
    assert_eq!(renderer.viewport(), viewport);
    renderer.render(&mut scene, &camera(viewport)).unwrap();
    let pixels = renderer.read_output().unwrap();
    assert_eq!(pixels.len(), 60);
    assert_eq!(pixel(&pixels, viewport, 5, 3), [255, 0, 0, 255]);
}

#[test]
fn empty_viewports_are_rejected() {
    let session = session();
    let mut scene = red_triangle_scene(&session);
    let viewport = Viewport::new(4, 4);
    let mut renderer =
        Renderer::new(&session, &primary_ray_pipeline(Vec::new()), viewport).unwrap();

    let result = renderer.resize(Viewport::new(0, 0));
    assert!(matches!(result, Err(RenderError::EmptyViewport { .. })));
    assert!(renderer.resize(Viewport::new(7, 0)).is_err());

    // The previous output is still the one being rendered to.
    assert_eq!(renderer.viewport(), viewport);
    renderer.render(&mut scene, &camera(viewport)).unwrap();
    assert_eq!(renderer.read_output().unwrap().len(), 16);

    let created = Renderer::new(&session, &primary_ray_pipeline(Vec::new()), Viewport::new(0, 3));
    assert!(matches!(created, Err(RenderError::EmptyViewport { width: 0, height: 3 })));
}

#[test]
fn sessions_come_from_config() {
    let config = Config::from_str(r#"{ "descriptor_heap_capacity": 32 }"#).unwrap();
    let session = RenderSession::from_config(&config).unwrap();
    assert_eq!(session.descriptors().capacity(), 32);
    assert_eq!(
        session.context().kind(),
        rt_renderer::backend::BackendKind::Fallback
    );
}
