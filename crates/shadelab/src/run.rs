use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use labconfig::{EngineConfig, MemoryProfile, PowerPreference};
use renderer::{
    encode_png, AnimationObserver, AnimationOptions, DeviceOptions, Dimensions, ExportSource,
    FrameProfile, GpuMemoryMode, GpuPowerPreference, ParameterValues, PrepareOptions,
    PreparedShader, ProcessedFrame, QualityPolicy, RenderRequest, Renderer, RendererOptions,
};
use shaderdef::ShaderId;
use tracing_subscriber::EnvFilter;

use crate::cli::{AnimateArgs, RenderArgs};

const IDLE_SLEEP: Duration = Duration::from_millis(1);

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub fn renderer_options(config: &EngineConfig) -> RendererOptions {
    RendererOptions {
        device: DeviceOptions {
            power: match config.device.power {
                PowerPreference::Low => GpuPowerPreference::Low,
                PowerPreference::High => GpuPowerPreference::High,
            },
            memory: match config.device.memory {
                MemoryProfile::Performance => GpuMemoryMode::Performance,
                MemoryProfile::Balanced => GpuMemoryMode::Balanced,
            },
            force_fallback_adapter: config.device.fallback_adapter,
            hdr_display: config.device.hdr_display,
        },
        pool_max_per_key: config.pool.max_per_key,
        pool_max_age: config.pool.max_age,
        watchdog_timeout: config.watchdog.timeout,
        thumbnail_size: config.export.thumbnail_size,
    }
}

fn animation_options(config: &EngineConfig, args: &AnimateArgs) -> AnimationOptions {
    let animation = &config.animation;
    AnimationOptions {
        display: args.size,
        supersample: args.supersample.unwrap_or(animation.supersample),
        gamma: animation.gamma,
        contrast: animation.contrast,
        profile: args.profile || animation.profile,
        quality: QualityPolicy {
            check_window: animation.check_window,
            slow_frame_threshold: animation.slow_frame_threshold,
            slow_frame_limit: animation.slow_frame_limit,
        },
        parameters: args.params.iter().cloned().collect(),
        fps: animation.fps,
        ..AnimationOptions::default()
    }
}

pub fn render(config: &EngineConfig, args: RenderArgs) -> Result<()> {
    let shader = crate::load(&args.shader)?;
    let mut renderer =
        Renderer::new(renderer_options(config)).context("failed to initialise a GPU device")?;

    let request = RenderRequest {
        time: args.time,
        frame: 0,
        prepare: PrepareOptions {
            parameters: args.params.iter().cloned().collect::<ParameterValues>(),
            iterations: args.iterations,
            ..PrepareOptions::default()
        },
    };
    let started = Instant::now();
    let prepared = renderer
        .render(&shader, args.size, &request)
        .with_context(|| format!("failed to render shader '{}'", shader.id()))?;

    let gamma = args.gamma.unwrap_or(config.animation.gamma);
    let contrast = args.contrast.unwrap_or(config.animation.contrast);
    let result = export_render(&mut renderer, shader.id(), &prepared, &args, gamma, contrast);
    prepared.release();
    renderer.release_shader(shader.id());
    result?;

    tracing::info!(
        shader = %shader.id(),
        width = args.size.width,
        height = args.size.height,
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        out = %args.out.display(),
        "rendered frame"
    );
    Ok(())
}

fn export_render(
    renderer: &mut Renderer,
    shader: &ShaderId,
    prepared: &PreparedShader,
    args: &RenderArgs,
    gamma: f32,
    contrast: f32,
) -> Result<()> {
    let toned = if gamma != 1.0 || contrast != 1.0 {
        Some(renderer.apply_gamma_contrast(shader, prepared.output(), args.size, gamma, contrast)?)
    } else {
        None
    };
    let source = match &toned {
        Some(frame) => ExportSource::Texture(&frame.storage),
        None => ExportSource::Texture(prepared.output().texture()),
    };

    let png = renderer.render_to_png(source, None)?;
    write_file(&args.out, &png)?;

    if let Some(path) = &args.thumbnail {
        let thumbnail = renderer.render_thumbnail(source)?;
        write_file(path, &encode_png(&thumbnail)?)?;
        tracing::info!(
            path = %path.display(),
            width = thumbnail.width(),
            height = thumbnail.height(),
            "wrote thumbnail"
        );
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

/// Whole microseconds, saturating at `u64::MAX`.
fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Collects what the animation loop reports back to the command.
#[derive(Default)]
struct CommandObserver {
    frames: u32,
    last: Option<ProcessedFrame>,
    profiled: Vec<FrameProfile>,
    suggested: Option<Dimensions>,
}

impl AnimationObserver for CommandObserver {
    fn frame_ready(&mut self, _shader: &ShaderId, frame: &ProcessedFrame) {
        self.frames += 1;
        self.last = Some(frame.clone());
    }

    fn request_lower_resolution(&mut self, shader: &ShaderId, suggested: Dimensions) {
        tracing::warn!(
            shader = %shader,
            width = suggested.width,
            height = suggested.height,
            "frames are slow; consider a lower resolution"
        );
        self.suggested = Some(suggested);
    }

    fn frame_profiled(&mut self, shader: &ShaderId, profile: &FrameProfile) {
        tracing::info!(
            shader = %shader,
            frame = profile.frame,
            case = %profile.case.letter(),
            iterations = profile.iterations,
            execution_us = micros(profile.execution),
            feedback_us = micros(profile.feedback_copy),
            post_us = micros(profile.post_process),
            total_us = micros(profile.total),
            "frame profile"
        );
        self.profiled.push(*profile);
    }
}

pub fn animate(config: &EngineConfig, args: AnimateArgs) -> Result<()> {
    let shader = crate::load(&args.shader)?;
    let mut renderer =
        Renderer::new(renderer_options(config)).context("failed to initialise a GPU device")?;
    let options = animation_options(config, &args);
    renderer
        .start_animation(&shader, &options)
        .with_context(|| format!("failed to start animation for '{}'", shader.id()))?;
    if let Some(controller) = renderer.animator().controller(shader.id()) {
        tracing::info!(
            shader = %shader.id(),
            case = %controller.case().letter(),
            width = controller.prepared().dimensions().width,
            height = controller.prepared().dimensions().height,
            "animation started"
        );
    }

    let mut observer = CommandObserver::default();
    let started = Instant::now();
    while observer.frames < args.frames {
        let report = renderer.tick(Instant::now(), &mut observer);
        if report.device_lost {
            bail!("GPU device was lost after {} frames", observer.frames);
        }
        if !report.failed.is_empty() || !renderer.animator().is_animating(shader.id()) {
            bail!("animation for '{}' stopped after {} frames", shader.id(), observer.frames);
        }
        if report.rendered.is_empty() {
            thread::sleep(IDLE_SLEEP);
        }
    }
    let elapsed = started.elapsed();

    if let (Some(path), Some(frame)) = (&args.export_last, &observer.last) {
        let png = renderer.render_to_png(ExportSource::Texture(&frame.display), None)?;
        write_file(path, &png)?;
        tracing::info!(path = %path.display(), "wrote last frame");
    }
    renderer.stop_animation(shader.id());
    renderer.release_shader(shader.id());

    let seconds = elapsed.as_secs_f64();
    let fps = if seconds > 0.0 {
        f64::from(observer.frames) / seconds
    } else {
        0.0
    };
    println!(
        "{}: {} frames in {:.2}s ({fps:.1} fps)",
        shader.id(),
        observer.frames,
        seconds
    );
    if !observer.profiled.is_empty() {
        let total: Duration = observer.profiled.iter().map(|profile| profile.total).sum();
        println!(
            "  mean frame time: {:.2}ms over {} profiled frames",
            total.as_secs_f64() * 1000.0 / observer.profiled.len() as f64,
            observer.profiled.len()
        );
    }
    if let Some(suggested) = observer.suggested {
        println!(
            "  suggested render size: {}x{}",
            suggested.width, suggested.height
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::cli::ShaderArg;

    fn animate_args() -> AnimateArgs {
        AnimateArgs {
            shader: ShaderArg {
                shader: PathBuf::from("waves.wgsl"),
            },
            frames: 10,
            size: Dimensions::new(320, 200),
            supersample: None,
            profile: false,
            params: vec![("speed".into(), 2.0)],
            export_last: None,
        }
    }

    #[test]
    fn profile_micros_saturate() {
        assert_eq!(micros(Duration::from_millis(3)), 3_000);
        assert_eq!(micros(Duration::MAX), u64::MAX);
    }

    #[test]
    fn config_maps_onto_renderer_options() {
        let config = EngineConfig::from_toml_str(
            r#"
            [device]
            power = "low"
            fallback_adapter = true

            [pool]
            max_per_key = 2
            max_age = "10s"

            [watchdog]
            timeout = "750ms"

            [export]
            thumbnail_size = 64
            "#,
        )
        .unwrap();
        let options = renderer_options(&config);
        assert_eq!(options.device.power, GpuPowerPreference::Low);
        assert!(options.device.force_fallback_adapter);
        assert_eq!(options.pool_max_per_key, 2);
        assert_eq!(options.pool_max_age, Duration::from_secs(10));
        assert_eq!(options.watchdog_timeout, Duration::from_millis(750));
        assert_eq!(options.thumbnail_size, 64);
    }

    #[test]
    fn command_line_overrides_animation_config() {
        let config = EngineConfig::from_toml_str(
            r#"
            [animation]
            supersample = 1.5
            gamma = 2.2
            slow_frame_limit = 5
            check_window = 20
            "#,
        )
        .unwrap();
        let mut args = animate_args();
        let options = animation_options(&config, &args);
        assert_eq!(options.display, Dimensions::new(320, 200));
        assert_eq!(options.supersample, 1.5);
        assert_eq!(options.gamma, 2.2);
        assert_eq!(options.quality.slow_frame_limit, 5);
        assert_eq!(options.quality.check_window, 20);
        assert_eq!(options.parameters.get("speed"), Some(2.0));
        assert!(options.persist_feedback);

        args.supersample = Some(2.0);
        args.profile = true;
        let options = animation_options(&config, &args);
        assert_eq!(options.supersample, 2.0);
        assert!(options.profile);
    }
}
