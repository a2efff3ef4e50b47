use std::collections::HashMap;
use std::sync::Arc;

use crate::compile::{slots, CompiledProgram};
use crate::error::{Diagnostic, GpuError, GpuResult};
use crate::types::STORAGE_FORMAT;

use super::context::DeviceContext;
use super::scope;

/// Capability flags that shape the bind group layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LayoutFlags {
    pub has_params: bool,
    pub has_input_texture: bool,
    pub has_iterations: bool,
}

impl LayoutFlags {
    /// Iterating shaders and previous-frame readers both get the texture+sampler pair.
    pub fn binds_input_pair(&self) -> bool {
        self.has_input_texture || self.has_iterations
    }

    fn layout_key(&self) -> (bool, bool) {
        (self.has_params, self.binds_input_pair())
    }
}

/// Whether a pipeline request may be served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    #[default]
    Reuse,
    /// Always compile a fresh pipeline and leave the cache untouched.
    Fresh,
}

/// Bind group layout plus the pipeline layout wrapping it.
#[derive(Debug, Clone)]
pub struct BindLayout {
    pub bind_group_layout: wgpu::BindGroupLayout,
    pub pipeline_layout: wgpu::PipelineLayout,
    pub flags: LayoutFlags,
}

#[derive(Debug, Clone)]
pub struct ComputePipeline {
    pub pipeline: wgpu::ComputePipeline,
    pub layout: Arc<BindLayout>,
    pub program: Arc<CompiledProgram>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    label: String,
    entry_point: String,
}

/// Builds and caches compute pipelines over the slot convention.
pub struct PipelineBuilder {
    context: DeviceContext,
    layouts: HashMap<(bool, bool), Arc<BindLayout>>,
    pipelines: HashMap<PipelineKey, Arc<ComputePipeline>>,
}

impl PipelineBuilder {
    pub fn new(context: DeviceContext) -> Self {
        Self {
            context,
            layouts: HashMap::new(),
            pipelines: HashMap::new(),
        }
    }

    pub fn layout(&mut self, flags: LayoutFlags) -> Arc<BindLayout> {
        let device = self.context.device();
        self.layouts
            .entry(flags.layout_key())
            .or_insert_with(|| Arc::new(create_layout(device, flags)))
            .clone()
    }

    /// Returns a pipeline for `program`, cached under `(label, entry point)`.
    ///
    /// A cache hit whose stored program has different source text is a
    /// conflict and is rejected rather than silently reusing a stale pipeline.
    pub fn build(
        &mut self,
        program: &Arc<CompiledProgram>,
        label: &str,
        flags: LayoutFlags,
        policy: CachePolicy,
    ) -> GpuResult<Arc<ComputePipeline>> {
        self.context.ensure_alive()?;
        let key = PipelineKey {
            label: label.to_string(),
            entry_point: program.bindings().entry_point.clone(),
        };

        if policy == CachePolicy::Reuse {
            if let Some(cached) = self.pipelines.get(&key) {
                if cached.program.source() != program.source() {
                    return Err(GpuError::CacheKeyConflict {
                        key: label.to_string(),
                    });
                }
                if cached.layout.flags.layout_key() == flags.layout_key() {
                    tracing::trace!(label, "pipeline cache hit");
                    return Ok(cached.clone());
                }
                tracing::debug!(label, ?flags, "rebuilding cached pipeline for new layout flags");
            }
        }

        let layout = self.layout(flags);
        let pipeline = Arc::new(ComputePipeline {
            pipeline: create_pipeline(&self.context, program, &layout, label)?,
            layout,
            program: program.clone(),
        });
        if policy == CachePolicy::Reuse {
            self.pipelines.insert(key, pipeline.clone());
        }
        Ok(pipeline)
    }

    /// Tries to build a pipeline with the given capabilities and reports what went wrong.
    pub fn validate_pipeline(
        &mut self,
        program: &CompiledProgram,
        has_params: bool,
        has_input_texture: bool,
    ) -> Vec<Diagnostic> {
        if self.context.is_lost() {
            return vec![Diagnostic::new("GPU device was lost")];
        }
        let flags = LayoutFlags {
            has_params,
            has_input_texture,
            has_iterations: false,
        };
        let layout = self.layout(flags);
        let mut diagnostics = Vec::new();
        let bindings = program.bindings();
        if bindings.has_params && !has_params {
            diagnostics.push(Diagnostic::new(format!(
                "shader binds parameters at slot {} but the layout has none",
                slots::PARAMETERS
            )));
        }
        if bindings.has_input_texture && !has_input_texture {
            diagnostics.push(Diagnostic::new(format!(
                "shader reads a previous frame at slot {} but the layout has none",
                slots::PREVIOUS_FRAME
            )));
        }
        if let Err(err) = create_pipeline(&self.context, program, &layout, program.label()) {
            diagnostics.push(Diagnostic::new(err.to_string()));
        }
        diagnostics
    }

    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn clear_cache(&mut self) {
        self.pipelines.clear();
    }

    /// Drops any cached pipeline registered under `label`.
    pub fn evict(&mut self, label: &str) {
        self.pipelines.retain(|key, _| key.label != label);
    }
}

fn create_pipeline(
    context: &DeviceContext,
    program: &CompiledProgram,
    layout: &BindLayout,
    label: &str,
) -> GpuResult<wgpu::ComputePipeline> {
    let device = context.device();
    let (pipeline, error) = scope::capture(device, || {
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&layout.pipeline_layout),
            module: program.module(),
            entry_point: Some(program.bindings().entry_point.as_str()),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        })
    });
    match error {
        Some(err) => Err(GpuError::PipelineCreation(scope::describe(&err))),
        None => Ok(pipeline),
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn layout_entries(flags: LayoutFlags) -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = vec![
        uniform_entry(slots::FRAME_UNIFORMS),
        wgpu::BindGroupLayoutEntry {
            binding: slots::OUTPUT,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: STORAGE_FORMAT,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        },
    ];
    if flags.has_params {
        entries.push(uniform_entry(slots::PARAMETERS));
    }
    if flags.binds_input_pair() {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: slots::PREVIOUS_FRAME,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: slots::PREVIOUS_SAMPLER,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    entries
}

fn create_layout(device: &wgpu::Device, flags: LayoutFlags) -> BindLayout {
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("compute bind group layout"),
        entries: &layout_entries(flags),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("compute pipeline layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });
    BindLayout {
        bind_group_layout,
        pipeline_layout,
        flags,
    }
}

/// Resources bound for one dispatch.
pub struct BindResources<'a> {
    pub frame_uniforms: &'a wgpu::Buffer,
    pub output: &'a wgpu::TextureView,
    pub params: Option<&'a wgpu::Buffer>,
    pub input: Option<(&'a wgpu::TextureView, &'a wgpu::Sampler)>,
}

/// Creates a bind group for `layout`, failing if a slot the layout needs is missing.
pub(crate) fn create_bind_group(
    device: &wgpu::Device,
    layout: &BindLayout,
    resources: &BindResources<'_>,
) -> GpuResult<wgpu::BindGroup> {
    let mut entries = vec![
        wgpu::BindGroupEntry {
            binding: slots::FRAME_UNIFORMS,
            resource: resources.frame_uniforms.as_entire_binding(),
        },
        wgpu::BindGroupEntry {
            binding: slots::OUTPUT,
            resource: wgpu::BindingResource::TextureView(resources.output),
        },
    ];
    if layout.flags.has_params {
        let params = resources.params.ok_or_else(|| {
            GpuError::PipelineCreation("layout expects a parameter buffer".into())
        })?;
        entries.push(wgpu::BindGroupEntry {
            binding: slots::PARAMETERS,
            resource: params.as_entire_binding(),
        });
    }
    if layout.flags.binds_input_pair() {
        let (view, sampler) = resources.input.ok_or_else(|| {
            GpuError::PipelineCreation("layout expects an input texture".into())
        })?;
        entries.push(wgpu::BindGroupEntry {
            binding: slots::PREVIOUS_FRAME,
            resource: wgpu::BindingResource::TextureView(view),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: slots::PREVIOUS_SAMPLER,
            resource: wgpu::BindingResource::Sampler(sampler),
        });
    }
    Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("compute bind group"),
        layout: &layout.bind_group_layout,
        entries: &entries,
    }))
}
