//! Parameter uniform buffers.
//!
//! Parameters are packed as consecutive `f32`s in declaration order and the
//! buffer is padded to the 16-byte uniform alignment. Updates rewrite the same
//! buffer in place through a scratch vector that is sized once.
use std::collections::BTreeMap;

use shaderdef::ShaderParameter;
use wgpu::util::DeviceExt;

use crate::error::{GpuError, GpuResult};
use crate::gpu::context::DeviceContext;
use crate::gpu::scope;

/// Size of the zeroed buffer bound when a shader declares a parameter slot
/// but no `@param` annotations (16 floats).
pub const DUMMY_PARAM_BUFFER_SIZE: u64 = 64;

const UNIFORM_ALIGNMENT: u64 = 16;

/// Byte size of a parameter buffer holding `count` floats.
pub fn param_buffer_size(count: usize) -> u64 {
    let raw = 4 * count as u64;
    raw.div_ceil(UNIFORM_ALIGNMENT)
        .max(1)
        .saturating_mul(UNIFORM_ALIGNMENT)
}

/// Named parameter values supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterValues {
    values: BTreeMap<String, f32>,
}

impl ParameterValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every declared parameter at its default.
    pub fn from_defaults(parameters: &[ShaderParameter]) -> Self {
        parameters
            .iter()
            .map(|parameter| (parameter.name.clone(), parameter.default))
            .collect()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f32) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: f32) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parses a `name=value` assignment.
    pub fn parse_assignment(raw: &str) -> Result<(String, f32), String> {
        let (name, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("missing parameter name in '{raw}'"));
        }
        let value: f32 = value
            .trim()
            .parse()
            .map_err(|_| format!("'{}' is not a number", value.trim()))?;
        Ok((name.to_string(), value))
    }
}

impl FromIterator<(String, f32)> for ParameterValues {
    fn from_iter<I: IntoIterator<Item = (String, f32)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Packs `values` in declaration order into `out`, clamping to each range.
///
/// Missing values fall back to the declared default. Names that the shader
/// does not declare are rejected.
pub fn pack_parameters(
    parameters: &[ShaderParameter],
    values: &ParameterValues,
    out: &mut Vec<f32>,
) -> GpuResult<()> {
    if let Some((unknown, _)) = values
        .iter()
        .find(|(name, _)| !parameters.iter().any(|p| p.name == *name))
    {
        let known: Vec<&str> = parameters.iter().map(|p| p.name.as_str()).collect();
        return Err(GpuError::ParameterValidation(format!(
            "unknown parameter '{unknown}' (declared: {})",
            if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            }
        )));
    }

    let floats = (param_buffer_size(parameters.len()) / 4) as usize;
    out.clear();
    out.resize(floats, 0.0);
    for (slot, parameter) in out.iter_mut().zip(parameters) {
        let requested = values.get(&parameter.name).unwrap_or(parameter.default);
        let clamped = parameter.clamp(requested);
        if clamped != requested {
            tracing::debug!(
                name = %parameter.name,
                requested,
                clamped,
                "clamped parameter into declared range"
            );
        }
        *slot = clamped;
    }
    Ok(())
}

/// A uniform buffer holding one shader's parameters.
#[derive(Debug)]
pub struct ParameterBuffer {
    buffer: wgpu::Buffer,
    parameters: Vec<ShaderParameter>,
    scratch: Vec<f32>,
    dummy: bool,
}

impl ParameterBuffer {
    pub fn new(
        context: &DeviceContext,
        parameters: &[ShaderParameter],
        values: &ParameterValues,
    ) -> GpuResult<Self> {
        let mut scratch = Vec::new();
        pack_parameters(parameters, values, &mut scratch)?;
        let buffer = create_uniform(context, "shader parameters", bytemuck::cast_slice(&scratch))?;
        Ok(Self {
            buffer,
            parameters: parameters.to_vec(),
            scratch,
            dummy: false,
        })
    }

    /// Zeroed stand-in for shaders that bind parameters without declaring any.
    pub fn dummy(context: &DeviceContext) -> GpuResult<Self> {
        let zeros = [0u8; DUMMY_PARAM_BUFFER_SIZE as usize];
        let buffer = create_uniform(context, "dummy shader parameters", &zeros)?;
        Ok(Self {
            buffer,
            parameters: Vec::new(),
            scratch: Vec::new(),
            dummy: true,
        })
    }

    /// Rewrites the buffer in place. A dummy buffer ignores updates.
    pub fn update(&mut self, queue: &wgpu::Queue, values: &ParameterValues) -> GpuResult<()> {
        if self.dummy {
            return Ok(());
        }
        pack_parameters(&self.parameters, values, &mut self.scratch)?;
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(&self.scratch));
        Ok(())
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn parameters(&self) -> &[ShaderParameter] {
        &self.parameters
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    pub(crate) fn destroy(&self) {
        self.buffer.destroy();
    }
}

pub(crate) fn create_uniform(
    context: &DeviceContext,
    label: &str,
    contents: &[u8],
) -> GpuResult<wgpu::Buffer> {
    context.ensure_alive()?;
    let device = context.device();
    let (buffer, error) = scope::capture(device, || {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        })
    });
    match error {
        Some(err) => Err(GpuError::Allocation {
            size: contents.len() as u64,
            reason: scope::describe(&err),
        }),
        None => Ok(buffer),
    }
}
