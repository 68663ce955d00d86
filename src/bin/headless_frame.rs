/// Headless frame loop smoke test
///
/// Renders a grid of cubes behind a wall occluder into an offscreen target
/// for a fixed number of frames, exercising the full upload-arena and
/// culling path without a window.

use anyhow::{Context, Result};
use cgmath::{Matrix4, Point3, Vector3};

use basalt::pipeline::PipelineKind;
use basalt::scene::{RenderItem, RenderLayer, Vertex};
use basalt::{Camera, RenderContext, RendererConfig};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const FRAMES: u32 = 120;
const GRID: i32 = 16;

fn main() -> Result<()> {
    env_logger::init();
    println!("Headless frame loop: {} frames at {}x{}", FRAMES, WIDTH, HEIGHT);

    let instance = wgpu::Instance::default();
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .context("no suitable GPU adapter")?;
    println!("Adapter: {}", adapter.get_info().name);

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("Headless Device"),
            required_features: wgpu::Features::MULTI_DRAW_INDIRECT
                | wgpu::Features::MULTI_DRAW_INDIRECT_COUNT
                | wgpu::Features::INDIRECT_FIRST_INSTANCE,
            required_limits: wgpu::Limits::default(),
        },
        None,
    ))?;
    let device = std::sync::Arc::new(device);
    let queue = std::sync::Arc::new(queue);

    let target = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Offscreen Target"),
        size: wgpu::Extent3d {
            width: WIDTH,
            height: HEIGHT,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8UnormSrgb,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

    let context = RenderContext::new(
        device,
        queue,
        wgpu::TextureFormat::Rgba8UnormSrgb,
        WIDTH,
        HEIGHT,
    );
    let config = RendererConfig {
        pipeline: PipelineKind::Deferred,
        ..Default::default()
    };
    let mut pipeline = config.build(&context);

    let material = pipeline.push_material(basalt::Material::new("stone"));

    // A wall close to the camera plus a grid of cubes stretching away
    // behind it. Most of the grid should fall to occlusion culling.
    let (wall_vertices, wall_indices) = cube_mesh(Vector3::new(20.0, 10.0, 0.5));
    let wall = pipeline.push_model(
        RenderItem::new("wall", wall_vertices, wall_indices, material)
            .with_world(Matrix4::from_translation(Vector3::new(0.0, 0.0, -5.0))),
    )?;

    let (cube_vertices, cube_indices) = cube_mesh(Vector3::new(0.5, 0.5, 0.5));
    let mut cubes = Vec::new();
    for x in -GRID / 2..GRID / 2 {
        for z in 1..=GRID {
            let world = Matrix4::from_translation(Vector3::new(
                x as f32 * 2.0,
                0.0,
                -8.0 - z as f32 * 2.0,
            ));
            cubes.push(
                RenderItem::new("cube", cube_vertices.clone(), cube_indices.clone(), material)
                    .with_world(world),
            );
        }
    }
    let cube_items = pipeline.push_models(cubes)?;
    println!("Scene: 1 occluder, {} cubes", cube_items.len());

    let mut camera = Camera::new(WIDTH as f32 / HEIGHT as f32);
    camera.set_position(Point3::new(0.0, 0.0, 5.0));
    camera.set_target(Point3::new(0.0, 0.0, -10.0));

    let start = std::time::Instant::now();
    for frame in 0..FRAMES {
        pipeline.push_visible_models(RenderLayer::Occluder, &[wall]);
        pipeline.push_visible_models(RenderLayer::Opaque, &cube_items);

        let total = frame as f32 / 60.0;
        pipeline.update(&mut camera, total, 1.0 / 60.0)?;
        pipeline.draw(&target_view)?;
    }
    pipeline.flush()?;

    let elapsed = start.elapsed();
    println!(
        "{} frames in {:.1?} ({:.2} ms/frame)",
        FRAMES,
        elapsed,
        elapsed.as_secs_f64() * 1000.0 / FRAMES as f64
    );
    Ok(())
}

fn cube_mesh(half: Vector3<f32>) -> (Vec<Vertex>, Vec<u32>) {
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, tangent, bitangent) in faces {
        let n = Vector3::from(normal);
        let t = Vector3::from(tangent);
        let b = Vector3::from(bitangent);
        let base = vertices.len() as u32;
        for (u, v) in [(0.0f32, 0.0f32), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
            let dir = n + t * (u * 2.0 - 1.0) + b * (v * 2.0 - 1.0);
            let position = [dir.x * half.x, dir.y * half.y, dir.z * half.z];
            vertices.push(Vertex::new(position, normal, tangent, [u, v]));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}
