use std::sync::Arc;
use std::time::Instant;

use shaderdef::{ShaderDefinition, ShaderId, ShaderParameter};

use crate::compile::{CompiledProgram, ShaderCompiler};
use crate::error::{Diagnostic, GpuResult};
use crate::gpu::animation::{
    AnimationController, AnimationObserver, AnimationOptions, Animator, FrameServices, TickReport,
};
use crate::gpu::context::DeviceContext;
use crate::gpu::executor::Executor;
use crate::gpu::export::{ExportSource, ResultRenderer};
use crate::gpu::feedback::FeedbackLoop;
use crate::gpu::pipeline::{CachePolicy, PipelineBuilder};
use crate::gpu::pool::{BufferPool, PoolStats};
use crate::gpu::postprocess::{PostProcessor, ProcessedFrame};
use crate::gpu::prepare::{prepare, PrepareOptions, PreparedShader};
use crate::gpu::present::CanvasPresenter;
use crate::gpu::textures::TrackedTexture;
use crate::gpu::uniforms::FrameUniforms;
use crate::gpu::watchdog::{Watchdog, WorkStatus};
use crate::params::ParameterValues;
use crate::types::{Dimensions, RendererOptions};

/// Inputs for a single-shot render.
#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub time: f32,
    pub frame: u32,
    pub prepare: PrepareOptions,
}

/// Entry point tying the GPU components to one device context.
pub struct Renderer {
    context: DeviceContext,
    options: RendererOptions,
    compiler: ShaderCompiler,
    pipelines: PipelineBuilder,
    pool: BufferPool,
    feedback: FeedbackLoop,
    post: PostProcessor,
    results: ResultRenderer,
    executor: Executor,
    animator: Animator,
}

impl Renderer {
    /// Negotiates a headless device and builds every component on it.
    pub fn new(options: RendererOptions) -> GpuResult<Self> {
        let context = DeviceContext::new_headless(&options.device)?;
        Ok(Self::from_context(context, options))
    }

    pub fn from_context(context: DeviceContext, options: RendererOptions) -> Self {
        let watchdog = Watchdog::new(options.watchdog_timeout);
        Self {
            compiler: ShaderCompiler::new(context.clone()),
            pipelines: PipelineBuilder::new(context.clone()),
            pool: BufferPool::new(context.clone(), options.pool_max_per_key, options.pool_max_age)
                .with_watchdog(watchdog),
            feedback: FeedbackLoop::new(context.clone()),
            post: PostProcessor::new(context.clone()),
            results: ResultRenderer::new(context.clone(), options.thumbnail_size),
            executor: Executor::new(context.clone(), watchdog),
            animator: Animator::new(),
            context,
            options,
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn options(&self) -> &RendererOptions {
        &self.options
    }

    pub fn is_lost(&self) -> bool {
        self.context.is_lost()
    }

    pub fn compile(&mut self, source: &str, label: &str) -> GpuResult<Arc<CompiledProgram>> {
        self.compiler.compile(source, label)
    }

    /// Compiles without touching the program cache.
    pub fn validate(&self, source: &str, label: &str) -> GpuResult<Arc<CompiledProgram>> {
        self.compiler.validate(source, label)
    }

    pub fn clear_shader_cache(&mut self) {
        self.compiler.clear_cache();
        self.pipelines.clear_cache();
    }

    pub fn validate_pipeline(
        &mut self,
        program: &CompiledProgram,
        has_params: bool,
        has_input_texture: bool,
    ) -> Vec<Diagnostic> {
        self.pipelines
            .validate_pipeline(program, has_params, has_input_texture)
    }

    pub fn parse_parameters(&self, source: &str) -> Vec<ShaderParameter> {
        shaderdef::parse_parameters(source)
    }

    pub fn prepare(
        &mut self,
        shader: &ShaderDefinition,
        dimensions: Dimensions,
        options: &PrepareOptions,
    ) -> GpuResult<PreparedShader> {
        prepare(
            &self.context,
            &mut self.compiler,
            &mut self.pipelines,
            shader,
            dimensions,
            options,
        )
    }

    /// Prepares `shader` and renders one frame into its output texture.
    ///
    /// Iterating shaders run the feedback loop seeded from black. The caller
    /// owns the returned bundle and must release it.
    pub fn render(
        &mut self,
        shader: &ShaderDefinition,
        dimensions: Dimensions,
        request: &RenderRequest,
    ) -> GpuResult<PreparedShader> {
        let prepared = self.prepare(shader, dimensions, &request.prepare)?;
        match self.execute_once(&prepared, request) {
            Ok(status) => {
                if status == WorkStatus::TimedOut {
                    tracing::warn!(shader = %shader.id(), "single-shot render did not finish in time");
                }
                Ok(prepared)
            }
            Err(err) => {
                prepared.release();
                Err(err)
            }
        }
    }

    fn execute_once(&self, prepared: &PreparedShader, request: &RenderRequest) -> GpuResult<WorkStatus> {
        let mut uniforms = FrameUniforms::new(prepared.dimensions());
        uniforms.set_time(request.time, request.frame);
        uniforms.write(self.context.queue(), prepared.frame_uniforms());

        if prepared.has_iterations() {
            let device = self.context.device();
            self.feedback.run(
                prepared.dimensions(),
                prepared.iterations(),
                prepared.output().texture(),
                None,
                |iteration, encoder| {
                    let bind_group = prepared
                        .bind_group_with(device, Some((iteration.previous, iteration.sampler)))?;
                    Executor::encode(encoder, &prepared.dispatch(&bind_group));
                    Ok(())
                },
            )?;
            self.executor.wait()
        } else {
            let bind_group = prepared.bind_group(self.context.device(), None)?;
            let execution = self.executor.execute(&prepared.dispatch(&bind_group))?;
            tracing::debug!(
                shader = %prepared.shader(),
                elapsed_ms = execution.elapsed.as_secs_f64() * 1000.0,
                "single-shot dispatch finished"
            );
            Ok(execution.status)
        }
    }

    pub fn apply_gamma_contrast(
        &mut self,
        shader: &ShaderId,
        input: &TrackedTexture,
        display: Dimensions,
        gamma: f32,
        contrast: f32,
    ) -> GpuResult<ProcessedFrame> {
        let frame = self
            .post
            .apply_gamma_contrast(shader, input, display, gamma, contrast)?;
        self.executor.wait()?;
        Ok(frame)
    }

    /// Drops every GPU resource held on behalf of `shader`.
    pub fn release_shader(&mut self, shader: &ShaderId) {
        self.animator.stop(shader);
        self.post.release_shader(shader);
    }

    /// Stops any running animation for the shader, then starts a fresh one.
    pub fn start_animation(
        &mut self,
        shader: &ShaderDefinition,
        options: &AnimationOptions,
    ) -> GpuResult<()> {
        let id = shader.id().clone();
        self.animator.stop(&id);

        let prepare_options = PrepareOptions {
            parameters: options.parameters.clone(),
            iterations: options.iterations,
            cache: CachePolicy::Reuse,
        };
        let prepared = self.prepare(shader, options.render_dimensions(), &prepare_options)?;
        let token = self.animator.register(id.clone(), options.fps);
        match AnimationController::new(&self.context, prepared, options, token, Instant::now()) {
            Ok(controller) => {
                self.animator.insert(controller);
                Ok(())
            }
            Err(err) => {
                self.animator.stop(&id);
                Err(err)
            }
        }
    }

    pub fn stop_animation(&mut self, shader: &ShaderId) -> bool {
        self.animator.stop(shader)
    }

    pub fn reset_animation(&mut self, shader: &ShaderId) -> GpuResult<bool> {
        self.animator.reset(&self.context, shader, Instant::now())
    }

    pub fn set_animation_parameters(
        &mut self,
        shader: &ShaderId,
        values: &ParameterValues,
    ) -> GpuResult<bool> {
        match self.animator.controller_mut(shader) {
            Some(controller) => controller
                .set_parameters(self.context.queue(), values)
                .map(|()| true),
            None => Ok(false),
        }
    }

    pub fn set_animation_tone(&mut self, shader: &ShaderId, gamma: f32, contrast: f32) -> bool {
        match self.animator.controller_mut(shader) {
            Some(controller) => {
                controller.set_tone(gamma, contrast);
                true
            }
            None => false,
        }
    }

    pub fn animator(&self) -> &Animator {
        &self.animator
    }

    /// Advances every due animation by one frame.
    pub fn tick(&mut self, now: Instant, observer: &mut dyn AnimationObserver) -> TickReport {
        let mut services = FrameServices {
            context: &self.context,
            feedback: &self.feedback,
            post: &mut self.post,
            watchdog: self.executor.watchdog(),
        };
        self.animator.tick(&mut services, now, observer)
    }

    pub fn render_to_image(
        &mut self,
        source: ExportSource<'_>,
        output: Option<Dimensions>,
    ) -> GpuResult<image::RgbaImage> {
        self.results.render_to_image(&mut self.pool, source, output)
    }

    pub fn render_to_png(
        &mut self,
        source: ExportSource<'_>,
        output: Option<Dimensions>,
    ) -> GpuResult<Vec<u8>> {
        self.results.render_to_png(&mut self.pool, source, output)
    }

    pub fn render_thumbnail(&mut self, source: ExportSource<'_>) -> GpuResult<image::RgbaImage> {
        self.results.render_thumbnail(&mut self.pool, source)
    }

    pub fn probe_pixel(&mut self, source: ExportSource<'_>, x: u32, y: u32) -> GpuResult<[u8; 4]> {
        self.results.probe_pixel(&mut self.pool, source, x, y)
    }

    pub fn buffer_pool(&mut self) -> &mut BufferPool {
        &mut self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Evicts idle pooled buffers past their age limit.
    pub fn cleanup(&mut self, now: Instant) -> usize {
        self.pool.cleanup(now)
    }

    pub fn canvas_presenter(&self) -> CanvasPresenter {
        CanvasPresenter::new(self.context.clone())
    }

    pub fn cached_programs(&self) -> usize {
        self.compiler.cached_programs()
    }

    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.cached_pipelines()
    }

    /// How many tone bind groups post-processing has built so far.
    pub fn post_bind_group_builds(&self) -> u64 {
        self.post.bind_group_builds()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.animator.clear();
        self.post.clear();
        self.pool.clear();
    }
}
