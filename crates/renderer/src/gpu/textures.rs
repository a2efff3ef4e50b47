//! Owned GPU textures with live-count bookkeeping.
//!
//! Every texture the renderer creates for its own use goes through
//! [`TrackedTexture`], which destroys the GPU allocation when dropped and keeps
//! a per-label live count on the owning context. The counts are what lets the
//! tests assert that ping-pong and feedback textures never leak.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::types::Dimensions;

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

pub const PING_PONG_LABEL: &str = "ping-pong";
pub const FEEDBACK_LABEL: &str = "feedback";

#[derive(Debug, Clone, Default)]
pub(crate) struct TextureTracker {
    live: Arc<Mutex<BTreeMap<&'static str, usize>>>,
}

impl TextureTracker {
    fn acquire(&self, label: &'static str) {
        if let Ok(mut live) = self.live.lock() {
            *live.entry(label).or_insert(0) += 1;
        }
    }

    fn release(&self, label: &'static str) {
        if let Ok(mut live) = self.live.lock() {
            if let Some(count) = live.get_mut(label) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub(crate) fn live(&self, label: &str) -> usize {
        self.live
            .lock()
            .ok()
            .and_then(|live| live.get(label).copied())
            .unwrap_or(0)
    }
}

/// A texture plus its default view, destroyed on drop.
#[derive(Debug)]
pub struct TrackedTexture {
    id: u64,
    label: &'static str,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    dimensions: Dimensions,
    tracker: TextureTracker,
}

impl TrackedTexture {
    pub(crate) fn create(
        device: &wgpu::Device,
        tracker: &TextureTracker,
        label: &'static str,
        descriptor: &wgpu::TextureDescriptor<'_>,
    ) -> Self {
        let texture = device.create_texture(descriptor);
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        tracker.acquire(label);
        Self {
            id: NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed),
            label,
            dimensions: Dimensions::new(descriptor.size.width, descriptor.size.height),
            texture,
            view,
            tracker: tracker.clone(),
        }
    }

    /// Process-unique identity, stable for the lifetime of the texture.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.texture.format()
    }

    /// View of a single mip level.
    pub fn mip_view(&self, level: u32) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("mip level view"),
            base_mip_level: level,
            mip_level_count: Some(1),
            ..Default::default()
        })
    }
}

impl Drop for TrackedTexture {
    fn drop(&mut self) {
        self.texture.destroy();
        self.tracker.release(self.label);
    }
}

pub(crate) fn storage_descriptor<'a>(
    label: &'a str,
    dimensions: Dimensions,
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
) -> wgpu::TextureDescriptor<'a> {
    wgpu::TextureDescriptor {
        label: Some(label),
        size: dimensions.extent(),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    }
}

/// Usage for textures that are written by compute and read back or copied.
pub(crate) const OUTPUT_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::STORAGE_BINDING
    .union(wgpu::TextureUsages::TEXTURE_BINDING)
    .union(wgpu::TextureUsages::COPY_SRC);

/// Usage for textures sampled as a previous frame and refreshed by copies.
pub(crate) const HISTORY_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::COPY_DST)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::RENDER_ATTACHMENT);

pub(crate) fn linear_sampler(device: &wgpu::Device, label: &str) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(label),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Linear,
        ..Default::default()
    })
}

/// Encodes a clear-to-black of a render-attachable texture view.
pub(crate) fn encode_clear(encoder: &mut wgpu::CommandEncoder, view: &wgpu::TextureView) {
    let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("clear texture"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view,
            depth_slice: None,
            resolve_target: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });
}

pub(crate) fn copy_whole(
    encoder: &mut wgpu::CommandEncoder,
    source: &wgpu::Texture,
    destination: &wgpu::Texture,
    dimensions: Dimensions,
) {
    encoder.copy_texture_to_texture(
        source.as_image_copy(),
        destination.as_image_copy(),
        dimensions.extent(),
    );
}
