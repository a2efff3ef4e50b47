//! GPU-resident tone adjustment and display promotion.
//!
//! Each shader gets a compute-resolution storage texture (the tone pass writes
//! there) and a display-resolution mipmapped texture. Both are pooled by
//! `(shader, width, height)`. The bind group is rebuilt only when the input
//! texture or the storage pool entry changes.
use std::collections::HashMap;

use shaderdef::ShaderId;

use crate::error::{GpuError, GpuResult};
use crate::types::{Dimensions, DISPLAY_FORMAT, WORKGROUP_TILE};

use super::context::DeviceContext;
use super::executor::{submit_encoder, workgroup_count};
use super::mipmap::Blitter;
use super::textures::{copy_whole, storage_descriptor, TrackedTexture};
use super::uniforms::ToneUniforms;

const TONE_SHADER: &str = r#"
struct Tone {
    gamma: f32,
    contrast: f32,
    padding: vec2<f32>,
};

@group(0) @binding(0) var input_frame: texture_2d<f32>;
@group(0) @binding(1) var toned_frame: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> tone: Tone;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(toned_frame);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }
    let color = textureLoad(input_frame, vec2<i32>(id.xy), 0);
    let corrected = pow(max(color.rgb, vec3<f32>(0.0)), vec3<f32>(1.0 / tone.gamma));
    let contrasted = (corrected - vec3<f32>(0.5)) * tone.contrast + vec3<f32>(0.5);
    textureStore(
        toned_frame,
        vec2<i32>(id.xy),
        vec4<f32>(clamp(contrasted, vec3<f32>(0.0), vec3<f32>(1.0)), clamp(color.a, 0.0, 1.0)),
    );
}
"#;

pub(crate) const STORAGE_POOL_LABEL: &str = "post storage";
pub(crate) const DISPLAY_POOL_LABEL: &str = "post display";

const STORAGE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::STORAGE_BINDING
    .union(wgpu::TextureUsages::TEXTURE_BINDING)
    .union(wgpu::TextureUsages::COPY_SRC);

const DISPLAY_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::RENDER_ATTACHMENT)
    .union(wgpu::TextureUsages::COPY_DST)
    .union(wgpu::TextureUsages::COPY_SRC);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub shader: ShaderId,
    pub width: u32,
    pub height: u32,
}

impl PoolKey {
    pub fn new(shader: &ShaderId, dimensions: Dimensions) -> Self {
        Self {
            shader: shader.clone(),
            width: dimensions.width,
            height: dimensions.height,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

/// Handles to one post-processed frame.
///
/// The textures belong to the post-processor's pools and are destroyed when
/// the shader is released or the pools are cleared.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub storage: wgpu::Texture,
    pub storage_view: wgpu::TextureView,
    pub display: wgpu::Texture,
    pub display_view: wgpu::TextureView,
    pub compute_dimensions: Dimensions,
    pub display_dimensions: Dimensions,
}

struct ToneSlot {
    uniforms: wgpu::Buffer,
    bound: Option<BoundInput>,
}

struct BoundInput {
    input: u64,
    key: PoolKey,
    bind_group: wgpu::BindGroup,
}

pub struct PostProcessor {
    context: DeviceContext,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    blitter: Blitter,
    storage: HashMap<PoolKey, TrackedTexture>,
    display: HashMap<PoolKey, TrackedTexture>,
    slots: HashMap<ShaderId, ToneSlot>,
    bind_group_builds: u64,
}

impl PostProcessor {
    pub fn new(context: DeviceContext) -> Self {
        let device = context.device();
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("tone shader"),
            source: wgpu::ShaderSource::Wgsl(TONE_SHADER.into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("tone layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: DISPLAY_FORMAT,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("tone pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("tone pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        let blitter = Blitter::new(device);

        Self {
            context,
            layout,
            pipeline,
            blitter,
            storage: HashMap::new(),
            display: HashMap::new(),
            slots: HashMap::new(),
            bind_group_builds: 0,
        }
    }

    /// Tone-maps `input` into the shader's storage texture and promotes it to
    /// the display texture, then fills the display mip chain.
    pub fn apply_gamma_contrast(
        &mut self,
        shader: &ShaderId,
        input: &TrackedTexture,
        display_dimensions: Dimensions,
        gamma: f32,
        contrast: f32,
    ) -> GpuResult<ProcessedFrame> {
        self.context.ensure_alive()?;
        let compute_dimensions = input.dimensions();
        let storage_key = PoolKey::new(shader, compute_dimensions);
        let display_key = PoolKey::new(shader, display_dimensions);

        self.ensure_storage(&storage_key)?;
        self.ensure_display(&display_key)?;
        self.bind(shader, input, &storage_key)?;

        let (Some(storage), Some(display), Some(slot)) = (
            self.storage.get(&storage_key),
            self.display.get(&display_key),
            self.slots.get(shader),
        ) else {
            return Err(GpuError::Execution(
                "post-processing pool entry disappeared".into(),
            ));
        };
        let Some(bound) = slot.bound.as_ref() else {
            return Err(GpuError::Execution(
                "post-processing bind group missing".into(),
            ));
        };

        let tone = ToneUniforms::new(sanitize(gamma), sanitize(contrast));
        self.context
            .queue()
            .write_buffer(&slot.uniforms, 0, bytemuck::bytes_of(&tone));

        let device = self.context.device();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("post-process"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("gamma/contrast"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bound.bind_group, &[]);
            let (x, y, z) = workgroup_count(compute_dimensions, WORKGROUP_TILE);
            pass.dispatch_workgroups(x, y, z);
        }

        if compute_dimensions == display_dimensions {
            copy_whole(&mut encoder, storage.texture(), display.texture(), display_dimensions);
        } else {
            let target = display.mip_view(0);
            self.blitter
                .blit(device, &mut encoder, storage.view(), &target, DISPLAY_FORMAT);
        }
        self.blitter.generate_mipmaps(device, &mut encoder, display);

        let frame = ProcessedFrame {
            storage: storage.texture().clone(),
            storage_view: storage.view().clone(),
            display: display.texture().clone(),
            display_view: display.view().clone(),
            compute_dimensions,
            display_dimensions,
        };
        submit_encoder(&self.context, encoder)?;
        Ok(frame)
    }

    /// Number of times a tone bind group had to be built.
    pub fn bind_group_builds(&self) -> u64 {
        self.bind_group_builds
    }

    /// Drops every pooled texture and cached binding for `shader`.
    pub fn release_shader(&mut self, shader: &ShaderId) {
        self.storage.retain(|key, _| &key.shader != shader);
        self.display.retain(|key, _| &key.shader != shader);
        if let Some(slot) = self.slots.remove(shader) {
            slot.uniforms.destroy();
        }
    }

    pub fn clear(&mut self) {
        self.storage.clear();
        self.display.clear();
        for (_, slot) in self.slots.drain() {
            slot.uniforms.destroy();
        }
    }

    /// Number of pooled textures across both pools.
    pub fn pooled_textures(&self) -> usize {
        self.storage.len() + self.display.len()
    }

    fn ensure_storage(&mut self, key: &PoolKey) -> GpuResult<()> {
        if self.storage.contains_key(key) {
            return Ok(());
        }
        self.storage.retain(|existing, _| existing.shader != key.shader);
        let texture = self.context.create_texture(
            STORAGE_POOL_LABEL,
            &storage_descriptor(STORAGE_POOL_LABEL, key.dimensions(), DISPLAY_FORMAT, STORAGE_USAGE),
        )?;
        tracing::debug!(shader = %key.shader, dimensions = %key.dimensions(), "allocated post storage texture");
        self.storage.insert(key.clone(), texture);
        Ok(())
    }

    fn ensure_display(&mut self, key: &PoolKey) -> GpuResult<()> {
        if self.display.contains_key(key) {
            return Ok(());
        }
        self.display.retain(|existing, _| existing.shader != key.shader);
        let dimensions = key.dimensions();
        let descriptor = wgpu::TextureDescriptor {
            label: Some(DISPLAY_POOL_LABEL),
            size: dimensions.extent(),
            mip_level_count: dimensions.mip_level_count(),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DISPLAY_FORMAT,
            usage: DISPLAY_USAGE,
            view_formats: &[],
        };
        let texture = self.context.create_texture(DISPLAY_POOL_LABEL, &descriptor)?;
        tracing::debug!(shader = %key.shader, %dimensions, "allocated post display texture");
        self.display.insert(key.clone(), texture);
        Ok(())
    }

    fn bind(&mut self, shader: &ShaderId, input: &TrackedTexture, key: &PoolKey) -> GpuResult<()> {
        if !self.slots.contains_key(shader) {
            let uniforms = crate::params::create_uniform(
                &self.context,
                "tone uniforms",
                bytemuck::bytes_of(&ToneUniforms::new(1.0, 1.0)),
            )?;
            self.slots.insert(
                shader.clone(),
                ToneSlot {
                    uniforms,
                    bound: None,
                },
            );
        }
        let Some(slot) = self.slots.get_mut(shader) else {
            return Ok(());
        };
        let current = slot
            .bound
            .as_ref()
            .is_some_and(|bound| bound.input == input.id() && &bound.key == key);
        if current {
            return Ok(());
        }
        let Some(storage) = self.storage.get(key) else {
            return Ok(());
        };
        let bind_group = self
            .context
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("tone bind group"),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(input.view()),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(storage.view()),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: slot.uniforms.as_entire_binding(),
                    },
                ],
            });
        self.bind_group_builds += 1;
        slot.bound = Some(BoundInput {
            input: input.id(),
            key: key.clone(),
            bind_group,
        });
        Ok(())
    }
}

fn sanitize(value: f32) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_shader_is_valid_wgsl() {
        let module = naga::front::wgsl::parse_str(TONE_SHADER).unwrap();
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator.validate(&module).unwrap();
    }

    #[test]
    fn pool_keys_are_structured() {
        let a = PoolKey::new(&ShaderId::from("a1"), Dimensions::new(1, 11));
        let b = PoolKey::new(&ShaderId::from("a11"), Dimensions::new(1, 1));
        assert_ne!(a, b);
        assert_eq!(a.dimensions(), Dimensions::new(1, 11));
    }

    #[test]
    fn invalid_tone_values_fall_back_to_identity() {
        assert_eq!(sanitize(2.2), 2.2);
        assert_eq!(sanitize(0.0), 1.0);
        assert_eq!(sanitize(f32::NAN), 1.0);
    }
}
