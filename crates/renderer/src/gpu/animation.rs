//! Per-shader animation loops.
//!
//! An [`AnimationController`] owns everything one animating shader needs: the
//! prepared bundle, its frame clock, the persistent feedback texture and the
//! adaptive-quality monitor. The [`Animator`] registry drives controllers from
//! an external `tick(now)` and tears them down when they are stopped,
//! cancelled, fail, or the device goes away.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use scheduler::{
    AdaptiveQuality, CancellationToken, FrameClock, QualityPolicy, QualitySignal, Schedule,
};
use shaderdef::ShaderId;

use crate::error::{GpuError, GpuResult};
use crate::params::ParameterValues;
use crate::types::{Dimensions, ExecutionCase, FrameProfile, STORAGE_FORMAT};

use super::context::DeviceContext;
use super::executor::{submit_encoder, Executor};
use super::feedback::FeedbackLoop;
use super::postprocess::{PostProcessor, ProcessedFrame};
use super::prepare::PreparedShader;
use super::textures::{
    copy_whole, encode_clear, storage_descriptor, TrackedTexture, FEEDBACK_LABEL, HISTORY_USAGE,
};
use super::uniforms::FrameUniforms;
use super::watchdog::Watchdog;

/// Knobs for one animation instance.
#[derive(Debug, Clone)]
pub struct AnimationOptions {
    /// Size of the presented image.
    pub display: Dimensions,
    /// Render scale relative to `display`; values above 1 supersample.
    pub supersample: f32,
    pub gamma: f32,
    pub contrast: f32,
    pub profile: bool,
    /// Keep a previous-frame texture across frames for shaders that sample one.
    pub persist_feedback: bool,
    pub quality: QualityPolicy,
    pub iterations: Option<u32>,
    pub parameters: ParameterValues,
    /// Frame rate cap; `None` renders on every tick.
    pub fps: Option<f32>,
}

impl Default for AnimationOptions {
    fn default() -> Self {
        Self {
            display: Dimensions::new(512, 512),
            supersample: 1.0,
            gamma: 1.0,
            contrast: 1.0,
            profile: false,
            persist_feedback: true,
            quality: QualityPolicy::default(),
            iterations: None,
            parameters: ParameterValues::new(),
            fps: None,
        }
    }
}

impl AnimationOptions {
    pub fn render_dimensions(&self) -> Dimensions {
        self.display.scaled(self.supersample)
    }
}

/// Receives frames and signals from running animations.
pub trait AnimationObserver {
    fn frame_ready(&mut self, _shader: &ShaderId, _frame: &ProcessedFrame) {}

    /// Fired at most once per animation instance, with a suggested render size.
    fn request_lower_resolution(&mut self, _shader: &ShaderId, _suggested: Dimensions) {}

    fn frame_profiled(&mut self, _shader: &ShaderId, _profile: &FrameProfile) {}
}

impl AnimationObserver for () {}

/// Shared pieces a controller borrows for one frame.
pub struct FrameServices<'a> {
    pub context: &'a DeviceContext,
    pub feedback: &'a FeedbackLoop,
    pub post: &'a mut PostProcessor,
    pub watchdog: &'a Watchdog,
}

pub struct AnimationController {
    shader: ShaderId,
    prepared: PreparedShader,
    case: ExecutionCase,
    clock: FrameClock,
    uniforms: FrameUniforms,
    feedback: Option<TrackedTexture>,
    single_pass: Option<wgpu::BindGroup>,
    display: Dimensions,
    gamma: f32,
    contrast: f32,
    profile: bool,
    quality: AdaptiveQuality,
    token: CancellationToken,
    last_profile: Option<FrameProfile>,
}

impl AnimationController {
    pub fn new(
        context: &DeviceContext,
        prepared: PreparedShader,
        options: &AnimationOptions,
        token: CancellationToken,
        now: Instant,
    ) -> GpuResult<Self> {
        let has_previous_frame = prepared.has_input_texture() && options.persist_feedback;
        let case = ExecutionCase::select(has_previous_frame, prepared.has_iterations());

        let feedback = if case.uses_history() {
            let texture = context.create_texture(
                FEEDBACK_LABEL,
                &storage_descriptor(
                    FEEDBACK_LABEL,
                    prepared.dimensions(),
                    STORAGE_FORMAT,
                    HISTORY_USAGE,
                ),
            )?;
            clear_texture(context, &texture)?;
            Some(texture)
        } else {
            None
        };

        let single_pass = if case.iterates() {
            None
        } else {
            let input = feedback.as_ref().map(TrackedTexture::view);
            Some(prepared.bind_group(context.device(), input)?)
        };

        tracing::debug!(
            shader = %prepared.shader(),
            case = %case.letter(),
            iterations = prepared.iterations(),
            render = %prepared.dimensions(),
            display = %options.display,
            "starting animation"
        );

        Ok(Self {
            shader: prepared.shader().clone(),
            uniforms: FrameUniforms::new(prepared.dimensions()),
            prepared,
            case,
            clock: FrameClock::new(now),
            feedback,
            single_pass,
            display: options.display,
            gamma: options.gamma,
            contrast: options.contrast,
            profile: options.profile,
            quality: AdaptiveQuality::new(options.quality),
            token,
            last_profile: None,
        })
    }

    pub fn shader(&self) -> &ShaderId {
        &self.shader
    }

    pub fn case(&self) -> ExecutionCase {
        self.case
    }

    pub fn frame(&self) -> u32 {
        self.clock.frame()
    }

    pub fn prepared(&self) -> &PreparedShader {
        &self.prepared
    }

    /// Persistent previous-frame texture, present for history cases only.
    pub fn feedback_texture(&self) -> Option<&TrackedTexture> {
        self.feedback.as_ref()
    }

    pub fn last_profile(&self) -> Option<&FrameProfile> {
        self.last_profile.as_ref()
    }

    pub fn quality(&self) -> &AdaptiveQuality {
        &self.quality
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn set_tone(&mut self, gamma: f32, contrast: f32) {
        self.gamma = gamma;
        self.contrast = contrast;
    }

    pub fn set_parameters(&mut self, queue: &wgpu::Queue, values: &ParameterValues) -> GpuResult<()> {
        self.prepared.update_parameters(queue, values)
    }

    /// Restarts time and frame count and blanks the feedback texture.
    pub fn reset(&mut self, context: &DeviceContext, now: Instant) -> GpuResult<()> {
        self.clock.reset(now);
        if let Some(feedback) = &self.feedback {
            clear_texture(context, feedback)?;
        }
        Ok(())
    }

    /// Renders one frame. Returns `None` when the animation was cancelled
    /// while the frame was in flight.
    pub fn render_frame(
        &mut self,
        services: &mut FrameServices<'_>,
        now: Instant,
        observer: &mut dyn AnimationObserver,
    ) -> GpuResult<Option<FrameProfile>> {
        if self.token.is_cancelled() {
            return Ok(None);
        }
        services.context.ensure_alive()?;
        let frame_started = Instant::now();

        let (time, frame) = self.clock.sample(now);
        self.uniforms.set_time(time, frame);
        self.uniforms
            .write(services.context.queue(), self.prepared.frame_uniforms());

        let stage = Instant::now();
        self.execute(services)?;
        let execution = self.settle(services, stage)?;

        let stage = Instant::now();
        if self.case.uses_history() {
            self.copy_to_feedback(services.context)?;
        }
        let feedback_copy = self.settle(services, stage)?;

        let stage = Instant::now();
        let processed = services.post.apply_gamma_contrast(
            &self.shader,
            self.prepared.output(),
            self.display,
            self.gamma,
            self.contrast,
        )?;
        let post_process = self.settle(services, stage)?;

        if !self.profile {
            services.watchdog.wait(services.context)?;
        }
        if self.token.is_cancelled() {
            tracing::trace!(shader = %self.shader, frame, "animation cancelled mid-frame");
            return Ok(None);
        }

        observer.frame_ready(&self.shader, &processed);
        let total = frame_started.elapsed();
        let profile = FrameProfile {
            frame,
            case: self.case,
            iterations: self.prepared.iterations(),
            resolution: self.prepared.dimensions(),
            execution,
            feedback_copy,
            post_process,
            total,
        };
        if self.profile {
            observer.frame_profiled(&self.shader, &profile);
        }
        self.last_profile = Some(profile);

        if self.quality.observe(frame, total) == QualitySignal::RequestLowerResolution {
            let suggested = self.prepared.dimensions().scaled(0.5);
            tracing::info!(
                shader = %self.shader,
                slow_frames = self.quality.slow_frames(),
                suggested = %suggested,
                "animation is running slowly; requesting a lower resolution"
            );
            observer.request_lower_resolution(&self.shader, suggested);
        }

        self.clock.advance();
        Ok(Some(profile))
    }

    /// With profiling on, waits for the stage and returns its duration.
    fn settle(&self, services: &FrameServices<'_>, started: Instant) -> GpuResult<Duration> {
        if self.profile {
            services.watchdog.wait(services.context)?;
        }
        Ok(started.elapsed())
    }

    fn execute(&self, services: &FrameServices<'_>) -> GpuResult<()> {
        let context = services.context;
        let prepared = &self.prepared;
        match self.case {
            ExecutionCase::IteratedWithHistory | ExecutionCase::Iterated => {
                let seed = self.feedback.as_ref().map(TrackedTexture::texture);
                services.feedback.run(
                    prepared.dimensions(),
                    prepared.iterations(),
                    prepared.output().texture(),
                    seed,
                    |iteration, encoder| {
                        let bind_group = prepared.bind_group_with(
                            context.device(),
                            Some((iteration.previous, iteration.sampler)),
                        )?;
                        Executor::encode(encoder, &prepared.dispatch(&bind_group));
                        Ok(())
                    },
                )?;
            }
            ExecutionCase::SingleWithHistory | ExecutionCase::Direct => {
                let bind_group = self.single_pass.as_ref().ok_or_else(|| {
                    GpuError::Execution("single-pass bind group missing".into())
                })?;
                let mut encoder =
                    context
                        .device()
                        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("animation frame"),
                        });
                Executor::encode(&mut encoder, &prepared.dispatch(bind_group));
                submit_encoder(context, encoder)?;
            }
        }
        Ok(())
    }

    fn copy_to_feedback(&self, context: &DeviceContext) -> GpuResult<()> {
        let Some(feedback) = &self.feedback else {
            return Ok(());
        };
        let mut encoder = context
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("feedback copy"),
            });
        copy_whole(
            &mut encoder,
            self.prepared.output().texture(),
            feedback.texture(),
            self.prepared.dimensions(),
        );
        submit_encoder(context, encoder)?;
        Ok(())
    }

    /// Releases the prepared bundle; the feedback texture is destroyed with `self`.
    pub fn teardown(self) {
        tracing::debug!(shader = %self.shader, frames = self.clock.frame(), "stopping animation");
        self.token.cancel();
        self.prepared.release();
    }
}

fn clear_texture(context: &DeviceContext, texture: &TrackedTexture) -> GpuResult<()> {
    let mut encoder = context
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("clear feedback"),
        });
    encode_clear(&mut encoder, texture.view());
    submit_encoder(context, encoder)?;
    Ok(())
}

/// What happened during one [`Animator::tick`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub rendered: Vec<ShaderId>,
    /// Animations removed because a frame failed.
    pub failed: Vec<ShaderId>,
    /// Set when the device was lost and every animation was dropped.
    pub device_lost: bool,
}

/// Registry of live animations, at most one per shader id.
#[derive(Default)]
pub struct Animator {
    schedule: Schedule<ShaderId>,
    controllers: HashMap<ShaderId, AnimationController>,
}

impl Animator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a loop for `shader` and returns its cancellation token.
    ///
    /// Any existing animation for the id must already be torn down; see
    /// [`Animator::stop`].
    pub fn register(&mut self, shader: ShaderId, fps: Option<f32>) -> CancellationToken {
        let started = self.schedule.start(shader.clone(), fps);
        if let Some(previous) = self.controllers.remove(&shader) {
            previous.teardown();
        }
        started.token
    }

    pub fn insert(&mut self, controller: AnimationController) {
        if let Some(previous) = self
            .controllers
            .insert(controller.shader().clone(), controller)
        {
            previous.teardown();
        }
    }

    /// Stops and tears down the animation for `shader`. Returns false if none was live.
    pub fn stop(&mut self, shader: &ShaderId) -> bool {
        let scheduled = self.schedule.stop(shader);
        match self.controllers.remove(shader) {
            Some(controller) => {
                controller.teardown();
                true
            }
            None => scheduled,
        }
    }

    pub fn reset(&mut self, context: &DeviceContext, shader: &ShaderId, now: Instant) -> GpuResult<bool> {
        match self.controllers.get_mut(shader) {
            Some(controller) => controller.reset(context, now).map(|()| true),
            None => Ok(false),
        }
    }

    pub fn is_animating(&self, shader: &ShaderId) -> bool {
        self.schedule.is_live(shader) && self.controllers.contains_key(shader)
    }

    pub fn controller(&self, shader: &ShaderId) -> Option<&AnimationController> {
        self.controllers.get(shader)
    }

    pub fn controller_mut(&mut self, shader: &ShaderId) -> Option<&mut AnimationController> {
        self.controllers.get_mut(shader)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Stops everything.
    pub fn clear(&mut self) {
        self.schedule.clear();
        for (_, controller) in self.controllers.drain() {
            controller.teardown();
        }
    }

    /// Renders one frame for every animation that is due at `now`.
    ///
    /// A failing frame stops only its own animation. Device loss drops every
    /// animation without notifying the observer.
    pub fn tick(
        &mut self,
        services: &mut FrameServices<'_>,
        now: Instant,
        observer: &mut dyn AnimationObserver,
    ) -> TickReport {
        let mut report = TickReport::default();
        if services.context.is_lost() {
            self.drop_after_loss(&mut report);
            return report;
        }

        for shader in self.schedule.due(now) {
            let Some(controller) = self.controllers.get_mut(&shader) else {
                continue;
            };
            match controller.render_frame(services, now, observer) {
                Ok(Some(_)) => report.rendered.push(shader),
                Ok(None) => {}
                Err(GpuError::DeviceLost) => {
                    self.drop_after_loss(&mut report);
                    return report;
                }
                Err(err) => {
                    tracing::warn!(shader = %shader, error = %err, "animation frame failed; stopping it");
                    report.failed.push(shader);
                }
            }
        }

        for shader in &report.failed {
            self.stop(shader);
        }
        for shader in self.schedule.sweep() {
            if let Some(controller) = self.controllers.remove(&shader) {
                controller.teardown();
            }
        }
        report
    }

    fn drop_after_loss(&mut self, report: &mut TickReport) {
        report.device_lost = true;
        if !self.controllers.is_empty() {
            tracing::debug!(animations = self.controllers.len(), "device lost; dropping animations");
        }
        self.schedule.clear();
        self.controllers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supersampling_scales_render_size() {
        let options = AnimationOptions {
            display: Dimensions::new(400, 300),
            supersample: 2.0,
            ..Default::default()
        };
        assert_eq!(options.render_dimensions(), Dimensions::new(800, 600));
        assert_eq!(
            AnimationOptions::default().render_dimensions(),
            Dimensions::new(512, 512)
        );
    }

    #[test]
    fn persisted_history_selects_cases() {
        assert_eq!(ExecutionCase::select(true, true).letter(), 'A');
        assert_eq!(ExecutionCase::select(true, false).letter(), 'B');
        assert_eq!(ExecutionCase::select(false, true).letter(), 'C');
        assert_eq!(ExecutionCase::select(false, false).letter(), 'D');
    }

    #[test]
    fn unit_observer_ignores_signals() {
        let mut observer: Box<dyn AnimationObserver> = Box::new(());
        observer.request_lower_resolution(&ShaderId::from("s"), Dimensions::new(1, 1));
        observer.frame_profiled(
            &ShaderId::from("s"),
            &FrameProfile {
                frame: 0,
                case: ExecutionCase::Direct,
                iterations: 1,
                resolution: Dimensions::new(1, 1),
                execution: Duration::ZERO,
                feedback_copy: Duration::ZERO,
                post_process: Duration::ZERO,
                total: Duration::ZERO,
            },
        );
    }
}
