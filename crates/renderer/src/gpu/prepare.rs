//! One-shot assembly of everything needed to dispatch a shader repeatedly.
use std::sync::Arc;

use shaderdef::{ShaderDefinition, ShaderId};

use crate::compile::{CompiledProgram, ShaderCompiler};
use crate::error::GpuResult;
use crate::params::{ParameterBuffer, ParameterValues};
use crate::types::{Dimensions, STORAGE_FORMAT};

use super::context::DeviceContext;
use super::executor::{workgroup_count, DispatchContext};
use super::pipeline::{
    create_bind_group, BindResources, CachePolicy, ComputePipeline, LayoutFlags, PipelineBuilder,
};
use super::textures::{
    linear_sampler, storage_descriptor, TrackedTexture, HISTORY_USAGE, OUTPUT_USAGE,
};
use super::uniforms::FrameUniforms;

pub(crate) const OUTPUT_LABEL: &str = "shader output";
pub(crate) const PLACEHOLDER_LABEL: &str = "placeholder input";

/// Caller overrides for [`prepare`].
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub parameters: ParameterValues,
    pub iterations: Option<u32>,
    pub cache: CachePolicy,
}

/// Effective iteration count: override, then stored, then declared, then 1.
pub fn resolve_iterations(shader: &ShaderDefinition, iteration_override: Option<u32>) -> u32 {
    iteration_override
        .filter(|count| *count > 0)
        .or_else(|| shader.iterations())
        .or_else(|| shader.declared_iterations())
        .unwrap_or(1)
}

/// Compiled program, output texture, uniforms and pipeline for one shader at
/// one resolution.
///
/// Created once and reused across frames; only the uniform and parameter
/// buffers change afterwards. Call [`PreparedShader::release`] when done.
#[derive(Debug)]
pub struct PreparedShader {
    shader: ShaderId,
    program: Arc<CompiledProgram>,
    pipeline: Arc<ComputePipeline>,
    output: TrackedTexture,
    frame_uniforms: wgpu::Buffer,
    params: Option<ParameterBuffer>,
    sampler: wgpu::Sampler,
    placeholder: Option<TrackedTexture>,
    dimensions: Dimensions,
    workgroups: (u32, u32, u32),
    iterations: u32,
    has_params: bool,
    has_input_texture: bool,
}

/// Builds a [`PreparedShader`] for `shader` rendered at `dimensions`.
pub fn prepare(
    context: &DeviceContext,
    compiler: &mut ShaderCompiler,
    pipelines: &mut PipelineBuilder,
    shader: &ShaderDefinition,
    dimensions: Dimensions,
    options: &PrepareOptions,
) -> GpuResult<PreparedShader> {
    let program = match options.cache {
        CachePolicy::Reuse => compiler.compile(shader.source(), shader.cache_key())?,
        CachePolicy::Fresh => compiler.validate(shader.source(), shader.cache_key())?,
    };
    let bindings = program.bindings().clone();

    let output = context.create_texture(
        OUTPUT_LABEL,
        &storage_descriptor(OUTPUT_LABEL, dimensions, STORAGE_FORMAT, OUTPUT_USAGE),
    )?;

    let uniforms = FrameUniforms::new(dimensions);
    let frame_uniforms =
        crate::params::create_uniform(context, "frame uniforms", bytemuck::bytes_of(&uniforms))?;

    let declared = shader.parameters();
    let params = match (bindings.has_params, declared.is_empty()) {
        (true, false) => Some(ParameterBuffer::new(context, declared, &options.parameters)?),
        (true, true) => {
            tracing::warn!(
                shader = %shader.id(),
                "shader binds a parameter uniform but declares no @param annotations; binding zeros"
            );
            Some(ParameterBuffer::dummy(context)?)
        }
        (false, false) => {
            tracing::warn!(
                shader = %shader.id(),
                count = declared.len(),
                "@param annotations present but the shader has no parameter binding; ignoring them"
            );
            None
        }
        (false, true) => None,
    };

    let iterations = resolve_iterations(shader, options.iterations);
    let flags = LayoutFlags {
        has_params: bindings.has_params,
        has_input_texture: bindings.has_input_texture,
        has_iterations: iterations > 1,
    };
    let pipeline = pipelines.build(&program, shader.cache_key(), flags, options.cache)?;

    let placeholder = if flags.binds_input_pair() {
        Some(create_placeholder(context)?)
    } else {
        None
    };

    let workgroups = workgroup_count(dimensions, bindings.dispatch_tile());
    tracing::debug!(
        shader = %shader.id(),
        %dimensions,
        iterations,
        has_params = flags.has_params,
        has_input_texture = flags.has_input_texture,
        "prepared shader"
    );

    Ok(PreparedShader {
        shader: shader.id().clone(),
        program,
        pipeline,
        output,
        frame_uniforms,
        params,
        sampler: linear_sampler(context.device(), "previous frame sampler"),
        placeholder,
        dimensions,
        workgroups,
        iterations,
        has_params: flags.has_params,
        has_input_texture: flags.has_input_texture,
    })
}

fn create_placeholder(context: &DeviceContext) -> GpuResult<TrackedTexture> {
    let dimensions = Dimensions::new(1, 1);
    let texture = context.create_texture(
        PLACEHOLDER_LABEL,
        &storage_descriptor(PLACEHOLDER_LABEL, dimensions, STORAGE_FORMAT, HISTORY_USAGE),
    )?;
    let black = [0u8; 8];
    context.queue().write_texture(
        texture.texture().as_image_copy(),
        &black,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(black.len() as u32),
            rows_per_image: None,
        },
        dimensions.extent(),
    );
    Ok(texture)
}

impl PreparedShader {
    pub fn shader(&self) -> &ShaderId {
        &self.shader
    }

    pub fn program(&self) -> &Arc<CompiledProgram> {
        &self.program
    }

    pub fn pipeline(&self) -> &Arc<ComputePipeline> {
        &self.pipeline
    }

    pub fn output(&self) -> &TrackedTexture {
        &self.output
    }

    pub fn frame_uniforms(&self) -> &wgpu::Buffer {
        &self.frame_uniforms
    }

    pub fn params(&self) -> Option<&ParameterBuffer> {
        self.params.as_ref()
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn workgroups(&self) -> (u32, u32, u32) {
        self.workgroups
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn has_iterations(&self) -> bool {
        self.iterations > 1
    }

    pub fn has_params(&self) -> bool {
        self.has_params
    }

    /// Whether the shader samples a previous frame at slot 3.
    pub fn has_input_texture(&self) -> bool {
        self.has_input_texture
    }

    /// Rewrites the parameter buffer in place.
    pub fn update_parameters(&mut self, queue: &wgpu::Queue, values: &ParameterValues) -> GpuResult<()> {
        match self.params.as_mut() {
            Some(params) => params.update(queue, values),
            None => Ok(()),
        }
    }

    /// Bind group reading `input` as the previous frame, or the black
    /// placeholder when the layout wants one and none is given.
    pub fn bind_group(
        &self,
        device: &wgpu::Device,
        input: Option<&wgpu::TextureView>,
    ) -> GpuResult<wgpu::BindGroup> {
        let input = input
            .or_else(|| self.placeholder.as_ref().map(TrackedTexture::view))
            .map(|view| (view, &self.sampler));
        self.bind_group_with(device, input)
    }

    pub(crate) fn bind_group_with(
        &self,
        device: &wgpu::Device,
        input: Option<(&wgpu::TextureView, &wgpu::Sampler)>,
    ) -> GpuResult<wgpu::BindGroup> {
        create_bind_group(
            device,
            &self.pipeline.layout,
            &BindResources {
                frame_uniforms: &self.frame_uniforms,
                output: self.output.view(),
                params: self.params.as_ref().map(ParameterBuffer::buffer),
                input,
            },
        )
    }

    pub fn dispatch<'a>(&'a self, bind_group: &'a wgpu::BindGroup) -> DispatchContext<'a> {
        DispatchContext {
            pipeline: &self.pipeline.pipeline,
            bind_group,
            workgroups: self.workgroups,
            label: self.program.label(),
        }
    }

    /// Destroys the GPU resources this bundle owns.
    pub fn release(self) {
        self.frame_uniforms.destroy();
        if let Some(params) = &self.params {
            params.destroy();
        }
        tracing::trace!(shader = %self.shader, "released prepared shader");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "// @iterations: 4\n@compute @workgroup_size(8, 8, 1)\nfn main() {}";

    #[test]
    fn iteration_count_precedence() {
        let shader = ShaderDefinition::new("s", "s", SOURCE);
        assert_eq!(resolve_iterations(&shader, None), 4);
        assert_eq!(resolve_iterations(&shader, Some(2)), 2);
        assert_eq!(resolve_iterations(&shader, Some(0)), 4);

        let stored = shader.clone().with_iterations(Some(7));
        assert_eq!(resolve_iterations(&stored, None), 7);
        assert_eq!(resolve_iterations(&stored, Some(3)), 3);

        let plain = ShaderDefinition::new("p", "p", "@compute @workgroup_size(8, 8, 1)\nfn main() {}");
        assert_eq!(resolve_iterations(&plain, None), 1);
    }
}
