use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::{GpuError, GpuResult};
use crate::types::{
    AdapterProfile, DeviceOptions, Dimensions, GpuMemoryMode, GpuPowerPreference, DISPLAY_FORMAT,
    STORAGE_FORMAT,
};

use super::textures::{TextureTracker, TrackedTexture};

/// Optional device features detected at negotiation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub float32_filterable: bool,
    pub shader_f16: bool,
    /// Format compute shaders write into. Always [`STORAGE_FORMAT`].
    pub storage_format: wgpu::TextureFormat,
    /// Narrow format used for post-processed output.
    pub display_format: wgpu::TextureFormat,
}

struct ContextInner {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_profile: AdapterProfile,
    capabilities: Capabilities,
    options: DeviceOptions,
    lost: Arc<AtomicBool>,
    textures: TextureTracker,
}

/// Adapter, device and queue negotiated once and shared by handle.
///
/// Cloning is cheap; every clone observes the same device-lost flag. After a
/// loss the context stays lost and callers must build a new one.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("adapter", &self.inner.adapter_profile.name)
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl DeviceContext {
    /// Negotiates an adapter and device without a presentation surface.
    pub fn new_headless(options: &DeviceOptions) -> GpuResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let power_preference = match options.power {
            GpuPowerPreference::Low => wgpu::PowerPreference::LowPower,
            GpuPowerPreference::High => wgpu::PowerPreference::HighPerformance,
        };
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: options.force_fallback_adapter,
        }))
        .map_err(|err| GpuError::Unsupported(format!("no suitable GPU adapter: {err}")))?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        let adapter_profile = AdapterProfile::from_wgpu(&info, &limits);
        tracing::debug!(
            name = %adapter_profile.name,
            backend = ?adapter_profile.backend,
            device_type = ?adapter_profile.device_type,
            is_software = adapter_profile.is_software(),
            "selected GPU adapter"
        );

        let storage_features = adapter.get_texture_format_features(STORAGE_FORMAT);
        if !storage_features
            .allowed_usages
            .contains(wgpu::TextureUsages::STORAGE_BINDING)
        {
            return Err(GpuError::Unsupported(format!(
                "adapter cannot write {STORAGE_FORMAT:?} from compute shaders"
            )));
        }

        let wanted = wgpu::Features::FLOAT32_FILTERABLE | wgpu::Features::SHADER_F16;
        let required_features = adapter.features() & wanted;
        let capabilities = Capabilities {
            float32_filterable: required_features.contains(wgpu::Features::FLOAT32_FILTERABLE),
            shader_f16: required_features.contains(wgpu::Features::SHADER_F16),
            storage_format: STORAGE_FORMAT,
            display_format: DISPLAY_FORMAT,
        };

        let memory_hints = match options.memory {
            GpuMemoryMode::Balanced => wgpu::MemoryHints::MemoryUsage,
            GpuMemoryMode::Performance => wgpu::MemoryHints::Performance,
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("shadelab device"),
            required_features,
            required_limits: limits,
            memory_hints,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| GpuError::Unsupported(format!("failed to create GPU device: {err}")))?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            lost_flag.store(true, Ordering::Release);
            if matches!(reason, wgpu::DeviceLostReason::Destroyed) {
                tracing::debug!(%message, "GPU device destroyed");
            } else {
                tracing::error!(?reason, %message, "GPU device lost");
            }
        });
        device.on_uncaptured_error(Box::new(|err| {
            tracing::error!(%err, "uncaptured GPU error");
        }));

        Ok(Self {
            inner: Arc::new(ContextInner {
                instance,
                adapter,
                device,
                queue,
                adapter_profile,
                capabilities,
                options: *options,
                lost,
                textures: TextureTracker::default(),
            }),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.inner.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.inner.queue
    }

    pub fn adapter_profile(&self) -> &AdapterProfile {
        &self.inner.adapter_profile
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn limits(&self) -> wgpu::Limits {
        self.inner.device.limits()
    }

    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Acquire)
    }

    pub fn ensure_alive(&self) -> GpuResult<()> {
        if self.is_lost() {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Destroys the device. Every clone reports lost from here on.
    pub fn destroy(&self) {
        self.inner.lost.store(true, Ordering::Release);
        self.inner.device.destroy();
    }

    /// Number of live renderer-owned textures created under `label`.
    pub fn live_textures(&self, label: &str) -> usize {
        self.inner.textures.live(label)
    }

    pub(crate) fn create_texture(
        &self,
        label: &'static str,
        descriptor: &wgpu::TextureDescriptor<'_>,
    ) -> GpuResult<TrackedTexture> {
        self.ensure_alive()?;
        let max = self.inner.adapter_profile.max_texture_dimension_2d;
        if descriptor.size.width > max || descriptor.size.height > max {
            return Err(GpuError::Allocation {
                size: texture_bytes(descriptor),
                reason: format!(
                    "{}x{} exceeds max texture dimension {max}",
                    descriptor.size.width, descriptor.size.height
                ),
            });
        }
        let (texture, error) = super::scope::capture(self.device(), || {
            TrackedTexture::create(self.device(), &self.inner.textures, label, descriptor)
        });
        match error {
            Some(err) => Err(GpuError::Allocation {
                size: texture_bytes(descriptor),
                reason: super::scope::describe(&err),
            }),
            None => Ok(texture),
        }
    }

    /// Creates a presentation surface for a window and configures it.
    pub fn attach_surface<T>(&self, target: &T, size: Dimensions) -> GpuResult<AttachedSurface>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        self.ensure_alive()?;
        let window_handle = target
            .window_handle()
            .map_err(|err| GpuError::Unsupported(format!("failed to acquire window handle: {err}")))?;
        let display_handle = target.display_handle().map_err(|err| {
            GpuError::Unsupported(format!("failed to acquire display handle: {err}"))
        })?;

        // SAFETY: the caller keeps the window alive for as long as the surface.
        let surface = unsafe {
            self.inner
                .instance
                .create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                    raw_display_handle: display_handle.as_raw(),
                    raw_window_handle: window_handle.as_raw(),
                })
        }
        .map_err(|err| GpuError::Unsupported(format!("failed to create surface: {err}")))?;

        let caps = surface.get_capabilities(&self.inner.adapter);
        let format = select_surface_format(&caps.formats, self.inner.options.hdr_display)
            .ok_or_else(|| {
                GpuError::Unsupported("surface is not compatible with the selected adapter".into())
            })?;
        let extended_range = format == wgpu::TextureFormat::Rgba16Float;

        let supports_copy = caps.usages.contains(wgpu::TextureUsages::COPY_DST);
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if supports_copy {
            usage |= wgpu::TextureUsages::COPY_DST;
        } else {
            tracing::warn!("surface does not advertise COPY_DST; presentation will blit");
        }

        let present_mode = caps
            .present_modes
            .iter()
            .copied()
            .find(|mode| *mode == wgpu::PresentMode::Fifo)
            .or_else(|| caps.present_modes.first().copied())
            .unwrap_or(wgpu::PresentMode::Fifo);
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage,
            format,
            width: size.width,
            height: size.height,
            present_mode,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(self.device(), &config);
        tracing::debug!(?format, extended_range, ?present_mode, "configured surface");

        Ok(AttachedSurface {
            surface,
            config,
            supports_copy,
            extended_range,
        })
    }
}

/// A configured presentation surface.
pub struct AttachedSurface {
    pub(crate) surface: wgpu::Surface<'static>,
    pub(crate) config: wgpu::SurfaceConfiguration,
    pub(crate) supports_copy: bool,
    pub(crate) extended_range: bool,
}

impl AttachedSurface {
    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.config.width, self.config.height)
    }

    pub fn is_extended_range(&self) -> bool {
        self.extended_range
    }

    pub fn resize(&mut self, context: &DeviceContext, size: Dimensions) {
        self.config.width = size.width;
        self.config.height = size.height;
        self.surface.configure(context.device(), &self.config);
    }
}

fn select_surface_format(
    formats: &[wgpu::TextureFormat],
    prefer_extended: bool,
) -> Option<wgpu::TextureFormat> {
    if prefer_extended {
        if let Some(format) = formats
            .iter()
            .copied()
            .find(|format| *format == wgpu::TextureFormat::Rgba16Float)
        {
            return Some(format);
        }
    }
    formats
        .iter()
        .copied()
        .find(|format| !format.is_srgb())
        .or_else(|| formats.first().copied())
}

fn texture_bytes(descriptor: &wgpu::TextureDescriptor<'_>) -> u64 {
    let block = descriptor.format.block_copy_size(None).unwrap_or(4);
    u64::from(descriptor.size.width) * u64::from(descriptor.size.height) * u64::from(block)
}
