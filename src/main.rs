use std::sync::Arc;

use anyhow::Context as _;
use env_logger::Env;
use rt_renderer::{
    backend::BackendKind,
    config_loader::ConfigFileLoader,
    pipeline::primary_ray_pipeline,
    render::unpack_rgba8,
    Camera, Geometry, GeometryDesc, Light, Material, RenderSession, Renderer, Scene, Vertex,
};
use ultraviolet::Vec3;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let mut config_loader = ConfigFileLoader::new("config.json");
    let config = config_loader.get_or_load_config()?.clone();

    let library = match &config.shader_library {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("could not read shader library {:?}", path))?,
        None if config.backend == BackendKind::Hardware => {
            anyhow::bail!("the hardware backend needs a compiled `shader_library`")
        }
        None => Vec::new(),
    };

    let session = RenderSession::from_config(&config)?;

    let material = Arc::new(Material::new("orange", Vec3::new(1.0, 0.5, 0.1)));
    let triangle = Geometry::new(
        &session,
        GeometryDesc {
            name: "triangle".into(),
            vertices: vec![
                Vertex::new([-1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0]),
                Vertex::new([1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0]),
                Vertex::new([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.5, 1.0]),
            ],
            indices: None,
            material: Some(material),
        },
    )?;

    let mut scene = Scene::new(&session);
    scene.add_geometry(triangle);
    scene.add_light(Light::Directional {
        direction: Vec3::new(0.0, 0.0, -1.0),
        color: Vec3::one(),
        intensity: 1.0,
    });

    let camera = Camera::new(
        config.camera.focal_point,
        config.camera.look_at,
        config.camera.up,
        config.camera.settings.clone(),
        config.viewport,
    );

    let mut renderer = Renderer::new(&session, &primary_ray_pipeline(library), config.viewport)?;
    for _ in 0..config.frames.max(1) {
        let stats = renderer.render(&mut scene, &camera)?;
        log::info!("{:?}", stats);
    }

    let pixels = renderer.read_output()?;
    let center = (config.viewport.height / 2) as usize * config.viewport.width as usize
        + (config.viewport.width / 2) as usize;
    if let Some(pixel) = pixels.get(center) {
        println!(
            "Rendered {} frames, center pixel {:?}",
            renderer.frame_count(),
            unpack_rgba8(*pixel)
        );
    }

    session.end_frame()?;
    Ok(())
}
