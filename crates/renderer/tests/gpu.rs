//! GPU integration tests. Each test returns early when no adapter is available.

use std::sync::Arc;
use std::time::{Duration, Instant};

use renderer::gpu::feedback::FeedbackLoop;
use renderer::gpu::watchdog::{Polled, Watchdog, WorkStatus};
use renderer::labels::{FEEDBACK_LABEL, PING_PONG_LABEL};
use renderer::{
    AnimationObserver, AnimationOptions, CachePolicy, Dimensions, ExecutionCase, ExportSource,
    GpuError, PrepareOptions, ProcessedFrame, RenderRequest, Renderer, RendererOptions,
    DUMMY_PARAM_BUFFER_SIZE,
};
use shaderdef::{ShaderDefinition, ShaderId};
use wgpu::util::DeviceExt;

const SOLID: &str = r#"
struct Frame { resolution: vec2<f32>, time: f32, frame: u32 }

@group(0) @binding(0) var<uniform> frame: Frame;
@group(0) @binding(1) var output: texture_storage_2d<rgba16float, write>;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (f32(id.x) >= frame.resolution.x || f32(id.y) >= frame.resolution.y) {
        return;
    }
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(0.25, 0.5, 0.75, 1.0));
}
"#;

const ACCUMULATE: &str = r#"
struct Frame { resolution: vec2<f32>, time: f32, frame: u32 }

@group(0) @binding(0) var<uniform> frame: Frame;
@group(0) @binding(1) var output: texture_storage_2d<rgba16float, write>;
@group(0) @binding(3) var previous: texture_2d<f32>;
@group(0) @binding(4) var previous_sampler: sampler;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (f32(id.x) >= frame.resolution.x || f32(id.y) >= frame.resolution.y) {
        return;
    }
    let uv = (vec2<f32>(id.xy) + vec2<f32>(0.5)) / frame.resolution;
    let last = textureSampleLevel(previous, previous_sampler, uv, 0.0);
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(last.rgb + vec3<f32>(0.125), 1.0));
}
"#;

const UNANNOTATED_PARAMS: &str = r#"
struct Params { gain: f32, pad: vec3<f32> }

@group(0) @binding(1) var output: texture_storage_2d<rgba16float, write>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(params.gain));
}
"#;

fn renderer_with(options: RendererOptions) -> Option<Renderer> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    match Renderer::new(options) {
        Ok(renderer) => Some(renderer),
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
    }
}

fn renderer() -> Option<Renderer> {
    renderer_with(RendererOptions::default())
}

fn close(actual: [u8; 4], expected: [u8; 4]) -> bool {
    actual
        .iter()
        .zip(expected)
        .all(|(a, e)| (i16::from(*a) - i16::from(e)).abs() <= 1)
}

#[test]
fn identical_source_shares_one_program() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let first = renderer.compile(SOLID, "first").unwrap();
    let second = renderer.compile(SOLID, "second").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(renderer.cached_programs(), 1);

    renderer.clear_shader_cache();
    let third = renderer.compile(SOLID, "third").unwrap();
    assert_ne!(first.id(), third.id());
}

#[test]
fn compile_errors_are_positioned() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let err = renderer.compile("fn main( {", "broken").unwrap_err();
    let GpuError::Compilation(failure) = err else {
        panic!("expected a compilation error, got {err}");
    };
    assert_eq!(failure.label, "broken");
    assert!(failure.primary().unwrap().line.is_some());
    assert_eq!(renderer.cached_programs(), 0);
}

#[test]
fn pipeline_validation_reports_missing_capabilities() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let program = renderer.compile(ACCUMULATE, "accumulate").unwrap();
    assert!(renderer.validate_pipeline(&program, false, true).is_empty());
    assert!(!renderer.validate_pipeline(&program, false, false).is_empty());
}

#[test]
fn feedback_loop_releases_ping_pong_textures() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let shader = ShaderDefinition::new("solid", "solid", SOLID);
    let dims = Dimensions::new(16, 16);
    let prepared = renderer
        .prepare(&shader, dims, &PrepareOptions::default())
        .unwrap();
    let context = renderer.context().clone();
    let feedback = FeedbackLoop::new(context.clone());

    let mut seen = Vec::new();
    feedback
        .run(dims, 3, prepared.output().texture(), None, |iteration, _| {
            seen.push(iteration.index);
            assert_eq!(context.live_textures(PING_PONG_LABEL), 2);
            Ok(())
        })
        .unwrap();
    assert_eq!(seen, [0, 1, 2]);
    assert_eq!(context.live_textures(PING_PONG_LABEL), 0);

    let err = feedback
        .run(dims, 4, prepared.output().texture(), None, |iteration, _| {
            if iteration.index == 1 {
                Err(GpuError::Execution("callback failed".into()))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
    assert!(matches!(err, GpuError::Execution(_)));
    assert_eq!(context.live_textures(PING_PONG_LABEL), 0);
    prepared.release();
}

#[test]
fn iterations_accumulate_within_one_render() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let source = format!("// @iterations: 4\n{ACCUMULATE}");
    let shader = ShaderDefinition::new("iterate", "iterate", source);
    let prepared = renderer
        .render(&shader, Dimensions::new(8, 8), &RenderRequest::default())
        .unwrap();
    assert_eq!(prepared.iterations(), 4);
    let texture = prepared.output().texture().clone();
    let pixel = renderer
        .probe_pixel(ExportSource::Texture(&texture), 3, 3)
        .unwrap();
    assert!(close(pixel, [128, 128, 128, 255]), "pixel {pixel:?}");
    assert_eq!(renderer.context().live_textures(PING_PONG_LABEL), 0);
    prepared.release();
}

#[test]
fn single_pass_history_matches_latest_output() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let shader = ShaderDefinition::new("history", "history", ACCUMULATE);
    let id = shader.id().clone();
    let options = AnimationOptions {
        display: Dimensions::new(8, 8),
        ..Default::default()
    };
    renderer.start_animation(&shader, &options).unwrap();

    for _ in 0..3 {
        let report = renderer.tick(Instant::now(), &mut ());
        assert_eq!(report.rendered, [id.clone()]);
    }

    let controller = renderer.animator().controller(&id).unwrap();
    assert_eq!(controller.case(), ExecutionCase::SingleWithHistory);
    assert_eq!(controller.frame(), 3);
    let output = controller.prepared().output().texture().clone();
    let feedback = controller.feedback_texture().unwrap().texture().clone();

    let rendered = renderer.probe_pixel(ExportSource::Texture(&output), 2, 5).unwrap();
    let stored = renderer.probe_pixel(ExportSource::Texture(&feedback), 2, 5).unwrap();
    assert_eq!(rendered, stored);
    assert_eq!(rendered, [96, 96, 96, 255]);
}

#[test]
fn iterated_history_carries_across_frames() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let source = format!("// @iterations: 2\n{ACCUMULATE}");
    let shader = ShaderDefinition::new("carry", "carry", source);
    let id = shader.id().clone();
    let options = AnimationOptions {
        display: Dimensions::new(8, 8),
        ..Default::default()
    };
    renderer.start_animation(&shader, &options).unwrap();

    for _ in 0..2 {
        let report = renderer.tick(Instant::now(), &mut ());
        assert_eq!(report.rendered, [id.clone()]);
    }
    assert_eq!(renderer.context().live_textures(PING_PONG_LABEL), 0);

    let controller = renderer.animator().controller(&id).unwrap();
    assert_eq!(controller.case(), ExecutionCase::IteratedWithHistory);
    assert_eq!(controller.prepared().iterations(), 2);
    let output = controller.prepared().output().texture().clone();
    let feedback = controller.feedback_texture().unwrap().texture().clone();

    // Two frames of two passes each, every pass adding 0.125.
    let rendered = renderer.probe_pixel(ExportSource::Texture(&output), 1, 6).unwrap();
    let stored = renderer.probe_pixel(ExportSource::Texture(&feedback), 1, 6).unwrap();
    assert!(close(rendered, [128, 128, 128, 255]), "rendered {rendered:?}");
    assert_eq!(rendered, stored);
}

#[test]
fn restarting_keeps_one_feedback_texture() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let shader = ShaderDefinition::new("restart", "restart", ACCUMULATE);
    let options = AnimationOptions {
        display: Dimensions::new(16, 16),
        ..Default::default()
    };
    renderer.start_animation(&shader, &options).unwrap();
    renderer.start_animation(&shader, &options).unwrap();
    assert_eq!(renderer.context().live_textures(FEEDBACK_LABEL), 1);
    assert_eq!(renderer.animator().len(), 1);

    for _ in 0..2 {
        renderer.tick(Instant::now(), &mut ());
    }
    let feedback = {
        let controller = renderer.animator().controller(shader.id()).unwrap();
        assert_eq!(controller.frame(), 2);
        controller.feedback_texture().unwrap().texture().clone()
    };
    let before = renderer
        .probe_pixel(ExportSource::Texture(&feedback), 7, 7)
        .unwrap();
    assert!(close(before, [64, 64, 64, 255]), "before reset {before:?}");

    assert!(renderer.reset_animation(shader.id()).unwrap());
    assert_eq!(renderer.animator().controller(shader.id()).unwrap().frame(), 0);
    let cleared = renderer
        .probe_pixel(ExportSource::Texture(&feedback), 7, 7)
        .unwrap();
    assert_eq!(cleared, [0, 0, 0, 0]);

    assert!(renderer.stop_animation(shader.id()));
    assert_eq!(renderer.context().live_textures(FEEDBACK_LABEL), 0);
    assert!(!renderer.stop_animation(shader.id()));
}

#[test]
fn identity_tone_preserves_colors() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let shader = ShaderDefinition::new("solid", "solid", SOLID);
    let dims = Dimensions::new(32, 32);
    let prepared = renderer
        .render(&shader, dims, &RenderRequest::default())
        .unwrap();
    let frame = renderer
        .apply_gamma_contrast(shader.id(), prepared.output(), dims, 1.0, 1.0)
        .unwrap();

    let raw_texture = prepared.output().texture().clone();
    let raw = renderer
        .probe_pixel(ExportSource::Texture(&raw_texture), 4, 4)
        .unwrap();
    let toned = renderer
        .probe_pixel(ExportSource::Texture(&frame.storage), 4, 4)
        .unwrap();
    let displayed = renderer
        .probe_pixel(ExportSource::Texture(&frame.display), 4, 4)
        .unwrap();
    assert!(close(raw, [64, 128, 191, 255]), "raw {raw:?}");
    assert!(close(toned, raw), "toned {toned:?} vs raw {raw:?}");
    assert!(close(displayed, raw), "displayed {displayed:?} vs raw {raw:?}");
    assert_eq!(frame.display.mip_level_count(), dims.mip_level_count());
    prepared.release();
}

#[test]
fn post_processing_reuses_bind_groups() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let shader = ShaderDefinition::new("solid", "solid", SOLID);
    let options = AnimationOptions {
        display: Dimensions::new(16, 16),
        supersample: 2.0,
        ..Default::default()
    };
    renderer.start_animation(&shader, &options).unwrap();
    let mut frames = 0;
    struct Count<'a>(&'a mut u32);
    impl AnimationObserver for Count<'_> {
        fn frame_ready(&mut self, _: &ShaderId, frame: &ProcessedFrame) {
            assert_eq!(frame.compute_dimensions, Dimensions::new(32, 32));
            assert_eq!(frame.display_dimensions, Dimensions::new(16, 16));
            *self.0 += 1;
        }
    }
    for _ in 0..3 {
        renderer.tick(Instant::now(), &mut Count(&mut frames));
    }
    assert_eq!(frames, 3);
    assert_eq!(renderer.post_bind_group_builds(), 1);

    // A restart hands post-processing a new output texture.
    renderer.start_animation(&shader, &options).unwrap();
    renderer.tick(Instant::now(), &mut Count(&mut frames));
    renderer.tick(Instant::now(), &mut Count(&mut frames));
    assert_eq!(frames, 5);
    assert_eq!(renderer.post_bind_group_builds(), 2);

    // So does a new render size, which also changes the pool key.
    let native = AnimationOptions {
        supersample: 1.0,
        ..options
    };
    renderer.start_animation(&shader, &native).unwrap();
    renderer.tick(Instant::now(), &mut ());
    renderer.tick(Instant::now(), &mut ());
    assert_eq!(renderer.post_bind_group_builds(), 3);
}

#[test]
fn device_loss_drops_animations_silently() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let shader = ShaderDefinition::new("lost", "lost", ACCUMULATE);
    renderer
        .start_animation(&shader, &AnimationOptions::default())
        .unwrap();
    renderer.context().destroy();

    let report = renderer.tick(Instant::now(), &mut ());
    assert!(report.device_lost);
    assert!(report.rendered.is_empty());
    assert!(renderer.animator().is_empty());
    assert!(matches!(
        renderer.compile(SOLID, "after"),
        Err(GpuError::DeviceLost)
    ));
}

#[test]
fn dummy_buffer_covers_unannotated_parameter_slot() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let shader = ShaderDefinition::new("params", "params", UNANNOTATED_PARAMS);
    let prepared = renderer
        .prepare(&shader, Dimensions::new(8, 8), &PrepareOptions::default())
        .unwrap();
    let params = prepared.params().unwrap();
    assert!(params.is_dummy());
    assert_eq!(params.size(), DUMMY_PARAM_BUFFER_SIZE);
    prepared.release();
}

#[test]
fn conflicting_cache_keys_are_rejected() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let dims = Dimensions::new(8, 8);
    let first = ShaderDefinition::new("a", "a", SOLID).with_cache_key("shared");
    let second = ShaderDefinition::new("b", "b", ACCUMULATE).with_cache_key("shared");
    let prepared = renderer
        .prepare(&first, dims, &PrepareOptions::default())
        .unwrap();
    let err = renderer
        .prepare(&second, dims, &PrepareOptions::default())
        .unwrap_err();
    assert!(matches!(err, GpuError::CacheKeyConflict { key } if key == "shared"));

    let fresh = PrepareOptions {
        cache: CachePolicy::Fresh,
        ..Default::default()
    };
    let bypassed = renderer.prepare(&second, dims, &fresh).unwrap();
    assert_eq!(renderer.cached_pipelines(), 1);
    prepared.release();
    bypassed.release();
}

#[test]
fn pool_reuses_released_buffers() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
    let pool = renderer.buffer_pool();
    let first = pool.allocate(256, usage).unwrap();
    assert_eq!(pool.stats().in_use, 1);
    pool.release(first);
    assert_eq!(pool.stats().in_use, 0);

    let again = pool.allocate(256, usage).unwrap();
    let other = pool.allocate(256, usage).unwrap();
    let stats = pool.stats();
    assert_eq!(stats.pooled, 2);
    assert_eq!(stats.in_use, 2);
    assert_eq!(stats.bytes, 512);
    pool.release(again);
    pool.release(other);

    assert!(matches!(
        pool.allocate(0, usage),
        Err(GpuError::Allocation { size: 0, .. })
    ));
}

#[test]
fn readback_returns_buffer_contents() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let bytes: Vec<u8> = (0..64).collect();
    let buffer = renderer
        .context()
        .device()
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("readback test"),
            contents: &bytes,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
    let pool = renderer.buffer_pool();
    assert_eq!(pool.read(&buffer, 0, 64).unwrap(), bytes);
    assert_eq!(pool.read(&buffer, 16, 8).unwrap(), &bytes[16..24]);
    assert!(pool.read(&buffer, 60, 8).is_err());
}

#[test]
fn exports_float_buffers_and_thumbnails() {
    let Some(mut renderer) = renderer_with(RendererOptions {
        thumbnail_size: 4,
        ..Default::default()
    }) else {
        return;
    };
    let pixels: Vec<f32> = (0..16)
        .flat_map(|index| {
            let red = if index % 2 == 0 { 1.0 } else { 0.0 };
            [red, 0.0, 0.0, 1.0]
        })
        .collect();
    let buffer = renderer
        .context()
        .device()
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("export source"),
            contents: bytemuck::cast_slice(&pixels),
            usage: wgpu::BufferUsages::STORAGE,
        });
    let source = ExportSource::Buffer {
        buffer: &buffer,
        dimensions: Dimensions::new(4, 4),
    };
    let image = renderer.render_to_image(source, None).unwrap();
    assert_eq!(image.dimensions(), (4, 4));
    assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0, 255]);
    assert_eq!(image.get_pixel(1, 0).0, [0, 0, 0, 255]);

    let halved = renderer
        .render_to_image(source, Some(Dimensions::new(2, 2)))
        .unwrap();
    assert!(close(halved.get_pixel(0, 0).0, [128, 0, 0, 255]));

    let png = renderer.render_to_png(source, None).unwrap();
    assert_eq!(&png[..4], b"\x89PNG");

    let shader = ShaderDefinition::new("wide", "wide", SOLID);
    let prepared = renderer
        .render(&shader, Dimensions::new(64, 32), &RenderRequest::default())
        .unwrap();
    let texture = prepared.output().texture().clone();
    let thumbnail = renderer
        .render_thumbnail(ExportSource::Texture(&texture))
        .unwrap();
    assert_eq!(thumbnail.dimensions(), (4, 2));
    prepared.release();
}

#[test]
fn idle_buffers_expire_after_max_age() {
    let max_age = Duration::from_secs(30);
    let Some(mut renderer) = renderer_with(RendererOptions {
        pool_max_age: max_age,
        ..Default::default()
    }) else {
        return;
    };
    let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
    let pool = renderer.buffer_pool();
    let idle = pool.allocate(256, usage).unwrap();
    let held = pool.allocate(512, usage).unwrap();
    pool.release(idle);

    let now = Instant::now();
    assert_eq!(renderer.cleanup(now), 0);
    assert_eq!(renderer.pool_stats().pooled, 2);

    assert_eq!(renderer.cleanup(now + max_age + Duration::from_millis(1)), 1);
    let stats = renderer.pool_stats();
    assert_eq!(stats.pooled, 1);
    assert_eq!(stats.in_use, 1);

    renderer.buffer_pool().release(held);
    renderer.cleanup(Instant::now() + max_age + Duration::from_millis(1));
    assert_eq!(renderer.pool_stats().pooled, 0);
}

#[test]
fn watchdog_bounds_undelivered_callbacks() {
    let Some(renderer) = renderer() else {
        return;
    };
    let watchdog = Watchdog::new(Duration::from_millis(20));
    let (sender, receiver) = crossbeam_channel::bounded::<()>(1);

    let started = Instant::now();
    let polled = watchdog.poll_until(renderer.context(), &receiver).unwrap();
    assert_eq!(polled, Polled::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(20));

    sender.send(()).unwrap();
    assert_eq!(
        watchdog.poll_until(renderer.context(), &receiver).unwrap(),
        Polled::Ready(())
    );
    drop(sender);
    assert_eq!(
        watchdog.poll_until(renderer.context(), &receiver).unwrap(),
        Polled::Dropped
    );
}

#[test]
fn batched_dispatches_fill_every_output() {
    let Some(mut renderer) = renderer() else {
        return;
    };
    let dims = Dimensions::new(8, 8);
    let red_source = SOLID.replace(
        "vec4<f32>(0.25, 0.5, 0.75, 1.0)",
        "vec4<f32>(1.0, 0.0, 0.0, 1.0)",
    );
    let solid = renderer
        .prepare(
            &ShaderDefinition::new("solid", "solid", SOLID),
            dims,
            &PrepareOptions::default(),
        )
        .unwrap();
    let red = renderer
        .prepare(
            &ShaderDefinition::new("red", "red", red_source),
            dims,
            &PrepareOptions::default(),
        )
        .unwrap();

    let device = renderer.context().device();
    let solid_group = solid.bind_group(device, None).unwrap();
    let red_group = red.bind_group(device, None).unwrap();
    let execution = renderer
        .executor()
        .execute_multiple(&[solid.dispatch(&solid_group), red.dispatch(&red_group)])
        .unwrap();
    assert_eq!(execution.status, WorkStatus::Completed);

    let solid_texture = solid.output().texture().clone();
    let red_texture = red.output().texture().clone();
    let first = renderer
        .probe_pixel(ExportSource::Texture(&solid_texture), 5, 2)
        .unwrap();
    let second = renderer
        .probe_pixel(ExportSource::Texture(&red_texture), 5, 2)
        .unwrap();
    assert!(close(first, [64, 128, 191, 255]), "first {first:?}");
    assert_eq!(second, [255, 0, 0, 255]);
    solid.release();
    red.release();
}
