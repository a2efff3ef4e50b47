//! WGSL compilation with a source-keyed program cache.
//!
//! Every source goes through naga first: parsing and validation there give
//! positioned diagnostics, and the parsed module tells us which of the
//! conventional bind group 0 slots the shader actually declares. Only then is
//! the module handed to wgpu, inside an error scope.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CompileFailure, Diagnostic, GpuResult};
use crate::gpu::context::DeviceContext;
use crate::gpu::scope;
use crate::types::WORKGROUP_TILE;

/// Binding slots of the bind group 0 convention.
pub mod slots {
    pub const FRAME_UNIFORMS: u32 = 0;
    pub const OUTPUT: u32 = 1;
    pub const PARAMETERS: u32 = 2;
    pub const PREVIOUS_FRAME: u32 = 3;
    pub const PREVIOUS_SAMPLER: u32 = 4;
}

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

/// What a shader declares in bind group 0, derived from its parsed module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBindings {
    pub has_frame_uniforms: bool,
    pub has_output_texture: bool,
    pub has_params: bool,
    pub has_input_texture: bool,
    pub has_input_sampler: bool,
    pub entry_point: String,
    pub workgroup_size: [u32; 3],
}

impl ShaderBindings {
    /// Tile used for dispatch; falls back to 8x8 when the size is degenerate.
    pub fn dispatch_tile(&self) -> [u32; 3] {
        if self.workgroup_size.iter().all(|side| *side > 0) {
            self.workgroup_size
        } else {
            WORKGROUP_TILE
        }
    }
}

/// Parses `source` and reports which conventional bindings it declares.
pub fn detect_bindings(source: &str) -> Result<ShaderBindings, CompileFailure> {
    let module = parse(source, "detect-bindings")?;
    bindings_from_module(&module)
        .map_err(|diagnostics| CompileFailure::new("detect-bindings", diagnostics))
}

fn parse(source: &str, label: &str) -> Result<naga::Module, CompileFailure> {
    naga::front::wgsl::parse_str(source).map_err(|err| {
        let diagnostic = match err.location(source) {
            Some(location) => {
                Diagnostic::at(err.message(), location.line_number, location.line_position)
            }
            None => Diagnostic::new(err.message()),
        };
        CompileFailure::new(label, vec![diagnostic])
    })
}

/// Parses and validates `source`, returning its bindings.
fn analyze(source: &str, label: &str) -> Result<ShaderBindings, CompileFailure> {
    let module = parse(source, label)?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    if let Err(err) = validator.validate(&module) {
        let mut message = err.as_inner().to_string();
        let mut cause = std::error::Error::source(err.as_inner());
        while let Some(inner) = cause {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            cause = std::error::Error::source(inner);
        }
        let diagnostic = match err.location(source) {
            Some(location) => Diagnostic::at(message, location.line_number, location.line_position),
            None => Diagnostic::new(message),
        };
        return Err(CompileFailure::new(label, vec![diagnostic]));
    }

    bindings_from_module(&module).map_err(|diagnostics| CompileFailure::new(label, diagnostics))
}

fn bindings_from_module(module: &naga::Module) -> Result<ShaderBindings, Vec<Diagnostic>> {
    let compute: Vec<_> = module
        .entry_points
        .iter()
        .filter(|entry| entry.stage == naga::ShaderStage::Compute)
        .collect();
    let entry = match compute.as_slice() {
        [] => {
            return Err(vec![Diagnostic::new(
                "shader declares no @compute entry point",
            )])
        }
        [single] => *single,
        [first, ..] => {
            tracing::warn!(
                count = compute.len(),
                entry = %first.name,
                "shader declares several compute entry points; using the first"
            );
            *first
        }
    };

    let mut bindings = ShaderBindings {
        has_frame_uniforms: false,
        has_output_texture: false,
        has_params: false,
        has_input_texture: false,
        has_input_sampler: false,
        entry_point: entry.name.clone(),
        workgroup_size: entry.workgroup_size,
    };

    for (_, variable) in module.global_variables.iter() {
        let Some(binding) = &variable.binding else {
            continue;
        };
        if binding.group != 0 {
            continue;
        }
        let inner = &module.types[variable.ty].inner;
        match (binding.binding, variable.space, inner) {
            (slots::FRAME_UNIFORMS, naga::AddressSpace::Uniform, _) => {
                bindings.has_frame_uniforms = true;
            }
            (
                slots::OUTPUT,
                naga::AddressSpace::Handle,
                naga::TypeInner::Image {
                    class: naga::ImageClass::Storage { .. },
                    ..
                },
            ) => bindings.has_output_texture = true,
            (slots::PARAMETERS, naga::AddressSpace::Uniform, _) => bindings.has_params = true,
            (
                slots::PREVIOUS_FRAME,
                naga::AddressSpace::Handle,
                naga::TypeInner::Image {
                    class: naga::ImageClass::Sampled { .. },
                    ..
                },
            ) => bindings.has_input_texture = true,
            (slots::PREVIOUS_SAMPLER, naga::AddressSpace::Handle, naga::TypeInner::Sampler { .. }) => {
                bindings.has_input_sampler = true;
            }
            (slot, space, _) => {
                tracing::debug!(
                    slot,
                    ?space,
                    name = ?variable.name,
                    "binding does not match the slot convention"
                );
            }
        }
    }

    if !bindings.has_output_texture {
        return Err(vec![Diagnostic::new(
            "shader must declare `@group(0) @binding(1) var output: texture_storage_2d<rgba16float, write>`",
        )]);
    }
    Ok(bindings)
}

/// A compiled module plus everything derived from its source.
#[derive(Debug)]
pub struct CompiledProgram {
    id: u64,
    label: String,
    source: String,
    module: wgpu::ShaderModule,
    bindings: ShaderBindings,
}

impl CompiledProgram {
    /// Process-unique identity; two handles with equal ids are the same program.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn module(&self) -> &wgpu::ShaderModule {
        &self.module
    }

    pub fn bindings(&self) -> &ShaderBindings {
        &self.bindings
    }
}

/// Compiles WGSL and caches programs by exact source text.
pub struct ShaderCompiler {
    context: DeviceContext,
    cache: HashMap<String, Arc<CompiledProgram>>,
}

impl ShaderCompiler {
    pub fn new(context: DeviceContext) -> Self {
        Self {
            context,
            cache: HashMap::new(),
        }
    }

    /// Compiles `source`, reusing a cached program for identical text.
    ///
    /// The label only names the program for diagnostics; it is not part of the
    /// cache key.
    pub fn compile(&mut self, source: &str, label: &str) -> GpuResult<Arc<CompiledProgram>> {
        if let Some(program) = self.cache.get(source) {
            tracing::trace!(label, cached = %program.label, "shader cache hit");
            return Ok(program.clone());
        }
        let program = Arc::new(self.build(source, label)?);
        self.cache.insert(source.to_string(), program.clone());
        tracing::debug!(label, programs = self.cache.len(), "compiled shader");
        Ok(program)
    }

    /// Compiles without consulting or filling the cache.
    pub fn validate(&self, source: &str, label: &str) -> GpuResult<Arc<CompiledProgram>> {
        Ok(Arc::new(self.build(source, label)?))
    }

    pub fn clear_cache(&mut self) {
        tracing::debug!(programs = self.cache.len(), "clearing shader cache");
        self.cache.clear();
    }

    pub fn cached_programs(&self) -> usize {
        self.cache.len()
    }

    fn build(&self, source: &str, label: &str) -> GpuResult<CompiledProgram> {
        self.context.ensure_alive()?;
        let bindings = analyze(source, label)?;

        let device = self.context.device();
        let (module, error) = scope::capture(device, || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        });
        if let Some(err) = error {
            return Err(CompileFailure::new(label, vec![Diagnostic::new(scope::describe(&err))]).into());
        }

        Ok(CompiledProgram {
            id: NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed),
            label: label.to_string(),
            source: source.to_string(),
            module,
            bindings,
        })
    }
}
