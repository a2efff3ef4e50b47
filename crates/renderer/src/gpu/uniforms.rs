use bytemuck::{Pod, Zeroable};

use crate::types::Dimensions;

/// Mirrors the WGSL `FrameUniforms` struct bound at slot 0:
///
/// ```wgsl
/// struct FrameUniforms { resolution: vec2<f32>, time: f32, frame: u32 }
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameUniforms {
    pub resolution: [f32; 2],
    pub time: f32,
    pub frame: u32,
}

unsafe impl Zeroable for FrameUniforms {}
unsafe impl Pod for FrameUniforms {}

impl FrameUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            resolution: [dimensions.width as f32, dimensions.height as f32],
            time: 0.0,
            frame: 0,
        }
    }

    pub fn set_time(&mut self, seconds: f32, frame: u32) {
        self.time = seconds;
        self.frame = frame;
    }

    pub fn write(&self, queue: &wgpu::Queue, buffer: &wgpu::Buffer) {
        queue.write_buffer(buffer, 0, bytemuck::bytes_of(self));
    }
}

/// Gamma/contrast settings for the post-processing pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ToneUniforms {
    pub gamma: f32,
    pub contrast: f32,
    pub _padding: [f32; 2],
}

unsafe impl Zeroable for ToneUniforms {}
unsafe impl Pod for ToneUniforms {}

impl ToneUniforms {
    pub fn new(gamma: f32, contrast: f32) -> Self {
        Self {
            gamma,
            contrast,
            _padding: [0.0; 2],
        }
    }
}

/// Source rectangle and destination size for the export conversion pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ConvertUniforms {
    pub src_origin: [u32; 2],
    pub src_size: [u32; 2],
    pub dst_size: [u32; 2],
    /// Row length in pixels of a buffer source; unused for textures.
    pub src_stride: u32,
    pub _padding: u32,
}

unsafe impl Zeroable for ConvertUniforms {}
unsafe impl Pod for ConvertUniforms {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_wgsl_sizes() {
        assert_eq!(FrameUniforms::SIZE, 16);
        assert_eq!(std::mem::size_of::<ToneUniforms>(), 16);
        assert_eq!(std::mem::size_of::<ConvertUniforms>(), 32);
    }

    #[test]
    fn frame_uniforms_pack_tightly() {
        let mut uniforms = FrameUniforms::new(Dimensions::new(640, 360));
        uniforms.set_time(1.5, 7);
        let bytes = bytemuck::bytes_of(&uniforms);
        assert_eq!(&bytes[0..4], &640.0f32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &1.5f32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &7u32.to_ne_bytes());
    }
}
