//! Export path: GPU conversion to packed 8-bit pixels, then one readback.
//!
//! Format conversion and box-filter downsampling run as a compute pass that
//! writes `pack4x8unorm` words into a pooled storage buffer. Only that final,
//! already-small buffer is copied to the host.
use std::io::Cursor;

use crate::error::{GpuError, GpuResult};
use crate::types::Dimensions;

use super::context::DeviceContext;
use super::executor::{submit_encoder, workgroup_count};
use super::pool::BufferPool;
use super::scope;
use super::uniforms::ConvertUniforms;
use crate::types::WORKGROUP_TILE;

const CONVERT_COMMON: &str = r#"
struct Convert {
    src_origin: vec2<u32>,
    src_size: vec2<u32>,
    dst_size: vec2<u32>,
    src_stride: u32,
    padding: u32,
};

@group(0) @binding(1) var<storage, read_write> pixels: array<u32>;
@group(0) @binding(2) var<uniform> params: Convert;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.dst_size.x || id.y >= params.dst_size.y) {
        return;
    }
    let start = params.src_origin + (id.xy * params.src_size) / params.dst_size;
    let stop = max(
        params.src_origin + ((id.xy + vec2<u32>(1u)) * params.src_size) / params.dst_size,
        start + vec2<u32>(1u),
    );
    var sum = vec4<f32>(0.0);
    var count = 0.0;
    for (var y = start.y; y < stop.y; y = y + 1u) {
        for (var x = start.x; x < stop.x; x = x + 1u) {
            sum = sum + load_source(vec2<u32>(x, y));
            count = count + 1.0;
        }
    }
    let color = clamp(sum / count, vec4<f32>(0.0), vec4<f32>(1.0));
    pixels[id.y * params.dst_size.x + id.x] = pack4x8unorm(color);
}
"#;

const TEXTURE_SOURCE: &str = r#"
@group(0) @binding(0) var source: texture_2d<f32>;

fn load_source(position: vec2<u32>) -> vec4<f32> {
    return textureLoad(source, vec2<i32>(position), 0);
}
"#;

const BUFFER_SOURCE: &str = r#"
@group(0) @binding(0) var<storage, read> source: array<vec4<f32>>;

fn load_source(position: vec2<u32>) -> vec4<f32> {
    return source[position.y * params.src_stride + position.x];
}
"#;

fn convert_shader(source: &str) -> String {
    format!("{source}\n{CONVERT_COMMON}")
}

/// Pixels to export: a float texture, or a storage buffer of `vec4<f32>`
/// pixels in row-major order.
#[derive(Debug, Clone, Copy)]
pub enum ExportSource<'a> {
    Texture(&'a wgpu::Texture),
    Buffer {
        buffer: &'a wgpu::Buffer,
        dimensions: Dimensions,
    },
}

impl ExportSource<'_> {
    pub fn dimensions(&self) -> Dimensions {
        match self {
            ExportSource::Texture(texture) => Dimensions::new(texture.width(), texture.height()),
            ExportSource::Buffer { dimensions, .. } => *dimensions,
        }
    }
}

/// Region of the source that maps onto the whole destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SourceRect {
    pub fn full(dimensions: Dimensions) -> Self {
        Self {
            x: 0,
            y: 0,
            width: dimensions.width,
            height: dimensions.height,
        }
    }

    fn fits(&self, dimensions: Dimensions) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|end| end <= dimensions.width)
            && self.y.checked_add(self.height).is_some_and(|end| end <= dimensions.height)
    }
}

struct ConvertPipeline {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl ConvertPipeline {
    fn new(device: &wgpu::Device, label: &str, source: &str, source_entry: wgpu::BindingType) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(convert_shader(source).into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: source_entry,
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
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
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        Self { layout, pipeline }
    }
}

/// Converts GPU results into host images for export.
pub struct ResultRenderer {
    context: DeviceContext,
    from_texture: ConvertPipeline,
    from_buffer: ConvertPipeline,
    thumbnail_size: u32,
}

impl ResultRenderer {
    pub fn new(context: DeviceContext, thumbnail_size: u32) -> Self {
        let device = context.device();
        let from_texture = ConvertPipeline::new(
            device,
            "convert texture",
            TEXTURE_SOURCE,
            wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
        );
        let from_buffer = ConvertPipeline::new(
            device,
            "convert buffer",
            BUFFER_SOURCE,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
        );
        Self {
            context,
            from_texture,
            from_buffer,
            thumbnail_size: thumbnail_size.max(1),
        }
    }

    /// Box-filters `rect` of `source` down (or up) to `output` and returns
    /// tightly packed RGBA8 rows.
    pub fn convert(
        &self,
        pool: &mut BufferPool,
        source: ExportSource<'_>,
        rect: SourceRect,
        output: Dimensions,
    ) -> GpuResult<Vec<u8>> {
        self.context.ensure_alive()?;
        let source_dimensions = source.dimensions();
        if !rect.fits(source_dimensions) {
            return Err(GpuError::Export(format!(
                "region {}x{}+{}+{} is outside the {source_dimensions} source",
                rect.width, rect.height, rect.x, rect.y
            )));
        }
        if let ExportSource::Buffer { buffer, dimensions } = source {
            let needed = dimensions.pixel_count() * 16;
            if buffer.size() < needed {
                return Err(GpuError::Export(format!(
                    "buffer holds {} bytes but {dimensions} vec4<f32> pixels need {needed}",
                    buffer.size()
                )));
            }
        }

        let uniforms = ConvertUniforms {
            src_origin: [rect.x, rect.y],
            src_size: [rect.width, rect.height],
            dst_size: [output.width, output.height],
            src_stride: source_dimensions.width,
            _padding: 0,
        };
        let uniform_buffer =
            crate::params::create_uniform(&self.context, "convert uniforms", bytemuck::bytes_of(&uniforms))?;

        let size = output.pixel_count() * 4;
        let pixels = pool.allocate(
            size,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        )?;

        let result = self.dispatch(source, &uniform_buffer, pixels.buffer(), output);
        let bytes = result.and_then(|()| pool.read(pixels.buffer(), 0, size));
        pool.release(pixels);
        uniform_buffer.destroy();
        bytes
    }

    fn dispatch(
        &self,
        source: ExportSource<'_>,
        uniforms: &wgpu::Buffer,
        pixels: &wgpu::Buffer,
        output: Dimensions,
    ) -> GpuResult<()> {
        let device = self.context.device();
        let view;
        let (convert, source_resource) = match source {
            ExportSource::Texture(texture) => {
                view = texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("export source"),
                    mip_level_count: Some(1),
                    ..Default::default()
                });
                (&self.from_texture, wgpu::BindingResource::TextureView(&view))
            }
            ExportSource::Buffer { buffer, .. } => (&self.from_buffer, buffer.as_entire_binding()),
        };

        let (bind_group, error) = scope::capture(device, || {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("convert bind group"),
                layout: &convert.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: source_resource,
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: pixels.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: uniforms.as_entire_binding(),
                    },
                ],
            })
        });
        if let Some(err) = error {
            return Err(GpuError::Export(scope::describe(&err)));
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("export conversion"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("export conversion"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&convert.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let (x, y, z) = workgroup_count(output, WORKGROUP_TILE);
            pass.dispatch_workgroups(x, y, z);
        }
        submit_encoder(&self.context, encoder)?;
        Ok(())
    }

    /// Converts the whole source, resized to `output` when given.
    pub fn render_to_image(
        &self,
        pool: &mut BufferPool,
        source: ExportSource<'_>,
        output: Option<Dimensions>,
    ) -> GpuResult<image::RgbaImage> {
        let source_dimensions = source.dimensions();
        let output = output.unwrap_or(source_dimensions);
        let bytes = self.convert(pool, source, SourceRect::full(source_dimensions), output)?;
        image::RgbaImage::from_raw(output.width, output.height, bytes)
            .ok_or_else(|| GpuError::Export("readback size does not match the image".into()))
    }

    /// PNG-encoded bytes of the whole source.
    pub fn render_to_png(
        &self,
        pool: &mut BufferPool,
        source: ExportSource<'_>,
        output: Option<Dimensions>,
    ) -> GpuResult<Vec<u8>> {
        let image = self.render_to_image(pool, source, output)?;
        encode_png(&image)
    }

    /// Downsampled copy whose longest side is at most the thumbnail size.
    pub fn render_thumbnail(
        &self,
        pool: &mut BufferPool,
        source: ExportSource<'_>,
    ) -> GpuResult<image::RgbaImage> {
        let output = source.dimensions().fit_within(self.thumbnail_size);
        self.render_to_image(pool, source, Some(output))
    }

    /// RGBA8 value of one source pixel.
    pub fn probe_pixel(
        &self,
        pool: &mut BufferPool,
        source: ExportSource<'_>,
        x: u32,
        y: u32,
    ) -> GpuResult<[u8; 4]> {
        let rect = SourceRect {
            x,
            y,
            width: 1,
            height: 1,
        };
        let bytes = self.convert(pool, source, rect, Dimensions::new(1, 1))?;
        match bytes.as_slice() {
            [r, g, b, a] => Ok([*r, *g, *b, *a]),
            _ => Err(GpuError::Export(format!(
                "expected 4 bytes for one pixel, got {}",
                bytes.len()
            ))),
        }
    }
}

pub fn encode_png(image: &image::RgbaImage) -> GpuResult<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|err| GpuError::Export(format!("failed to encode PNG: {err}")))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(source: &str) {
        let module = naga::front::wgsl::parse_str(&convert_shader(source)).unwrap();
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator.validate(&module).unwrap();
    }

    #[test]
    fn conversion_shaders_are_valid_wgsl() {
        validate(TEXTURE_SOURCE);
        validate(BUFFER_SOURCE);
    }

    #[test]
    fn source_rect_bounds() {
        let dims = Dimensions::new(4, 4);
        assert!(SourceRect::full(dims).fits(dims));
        assert!(SourceRect { x: 3, y: 3, width: 1, height: 1 }.fits(dims));
        assert!(!SourceRect { x: 4, y: 0, width: 1, height: 1 }.fits(dims));
        assert!(!SourceRect { x: 0, y: 0, width: 0, height: 1 }.fits(dims));
        assert!(!SourceRect { x: u32::MAX, y: 0, width: 2, height: 1 }.fits(dims));
    }

    #[test]
    fn encodes_png_signature() {
        let image = image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 0, 255]));
        let bytes = encode_png(&image).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }
}
