use crate::error::{GpuError, GpuResult};
use crate::types::Dimensions;

use super::context::{AttachedSurface, DeviceContext};
use super::executor::submit_encoder;
use super::mipmap::Blitter;
use super::postprocess::ProcessedFrame;

/// How a processed frame reaches the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentPath {
    /// Direct texture-to-texture copy.
    Copy,
    /// Filtered render-pass blit, for format or size mismatches.
    Blit,
}

pub fn choose_path(
    frame_format: wgpu::TextureFormat,
    frame_dimensions: Dimensions,
    surface_format: wgpu::TextureFormat,
    surface_dimensions: Dimensions,
    surface_supports_copy: bool,
) -> PresentPath {
    if surface_supports_copy
        && frame_format == surface_format
        && frame_dimensions == surface_dimensions
    {
        PresentPath::Copy
    } else {
        PresentPath::Blit
    }
}

/// Puts post-processed frames on a window surface without touching the CPU.
pub struct CanvasPresenter {
    context: DeviceContext,
    blitter: Blitter,
}

impl CanvasPresenter {
    pub fn new(context: DeviceContext) -> Self {
        let blitter = Blitter::new(context.device());
        Self { context, blitter }
    }

    pub fn present(
        &mut self,
        surface: &AttachedSurface,
        frame: &ProcessedFrame,
    ) -> GpuResult<PresentPath> {
        self.context.ensure_alive()?;
        let output = surface
            .surface
            .get_current_texture()
            .map_err(|err| GpuError::Execution(format!("failed to acquire surface texture: {err}")))?;
        let surface_dimensions = surface.dimensions();
        let path = choose_path(
            frame.display.format(),
            frame.display_dimensions,
            surface.format(),
            surface_dimensions,
            surface.supports_copy,
        );

        let device = self.context.device();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("present"),
        });
        match path {
            PresentPath::Copy => encoder.copy_texture_to_texture(
                frame.display.as_image_copy(),
                output.texture.as_image_copy(),
                surface_dimensions.extent(),
            ),
            PresentPath::Blit => {
                let target = output
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                self.blitter.blit(
                    device,
                    &mut encoder,
                    &frame.display_view,
                    &target,
                    surface.format(),
                );
            }
        }
        submit_encoder(&self.context, encoder)?;
        output.present();
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RGBA: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
    const BGRA: wgpu::TextureFormat = wgpu::TextureFormat::Bgra8Unorm;

    #[test]
    fn copies_only_on_exact_match() {
        let dims = Dimensions::new(640, 480);
        assert_eq!(choose_path(RGBA, dims, RGBA, dims, true), PresentPath::Copy);
        assert_eq!(choose_path(RGBA, dims, BGRA, dims, true), PresentPath::Blit);
        assert_eq!(choose_path(RGBA, dims, RGBA, dims, false), PresentPath::Blit);
        assert_eq!(
            choose_path(RGBA, dims, RGBA, Dimensions::new(320, 240), true),
            PresentPath::Blit
        );
    }
}
