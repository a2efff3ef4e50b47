use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Pixel format every compute shader writes into.
pub const STORAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

/// Eight-bit format used for post-processed and display textures.
pub const DISPLAY_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Default compute workgroup tile.
pub const WORKGROUP_TILE: [u32; 3] = [8, 8, 1];

/// Width and height in physical pixels. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Multiplies both sides by `factor`, rounding and keeping at least one pixel.
    pub fn scaled(&self, factor: f32) -> Self {
        let factor = if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            1.0
        };
        Self::new(
            (self.width as f32 * factor).round() as u32,
            (self.height as f32 * factor).round() as u32,
        )
    }

    /// Shrinks so the longest side is at most `max_side`. Never upscales.
    pub fn fit_within(&self, max_side: u32) -> Self {
        let longest = self.width.max(self.height);
        if longest <= max_side || max_side == 0 {
            return *self;
        }
        self.scaled(max_side as f32 / longest as f32)
    }

    /// Number of mip levels down to 1x1.
    pub fn mip_level_count(&self) -> u32 {
        32 - self.width.max(self.height).leading_zeros()
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Dimensions {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (w, h) = raw
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{raw}'"))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| format!("invalid width '{w}'"))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid height '{h}'"))?;
        if width == 0 || height == 0 {
            return Err("dimensions must be non-zero".into());
        }
        Ok(Self { width, height })
    }
}

/// Which of the four per-frame execution strategies runs for a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionCase {
    /// Iterated feedback loop seeded from the persistent previous frame.
    IteratedWithHistory,
    /// Single dispatch reading the persistent previous frame.
    SingleWithHistory,
    /// Iterated feedback loop seeded from black every frame.
    Iterated,
    /// One plain dispatch.
    Direct,
}

impl ExecutionCase {
    pub fn select(has_previous_frame: bool, has_iterations: bool) -> Self {
        match (has_previous_frame, has_iterations) {
            (true, true) => Self::IteratedWithHistory,
            (true, false) => Self::SingleWithHistory,
            (false, true) => Self::Iterated,
            (false, false) => Self::Direct,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            Self::IteratedWithHistory => 'A',
            Self::SingleWithHistory => 'B',
            Self::Iterated => 'C',
            Self::Direct => 'D',
        }
    }

    pub fn uses_history(&self) -> bool {
        matches!(self, Self::IteratedWithHistory | Self::SingleWithHistory)
    }

    pub fn iterates(&self) -> bool {
        matches!(self, Self::IteratedWithHistory | Self::Iterated)
    }
}

/// Wall-clock breakdown of one animation frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameProfile {
    pub frame: u32,
    pub case: ExecutionCase,
    pub iterations: u32,
    pub resolution: Dimensions,
    pub execution: Duration,
    pub feedback_copy: Duration,
    pub post_process: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPowerPreference {
    Low,
    #[default]
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuMemoryMode {
    Performance,
    #[default]
    Balanced,
}

/// Adapter negotiation knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceOptions {
    pub power: GpuPowerPreference,
    pub memory: GpuMemoryMode,
    pub force_fallback_adapter: bool,
    /// Prefer an extended-range surface format when one is available.
    pub hdr_display: bool,
}

/// Long-lived knobs for a [`crate::Renderer`].
#[derive(Debug, Clone, PartialEq)]
pub struct RendererOptions {
    pub device: DeviceOptions,
    pub pool_max_per_key: usize,
    pub pool_max_age: Duration,
    pub watchdog_timeout: Duration,
    pub thumbnail_size: u32,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            device: DeviceOptions::default(),
            pool_max_per_key: 4,
            pool_max_age: Duration::from_secs(60),
            watchdog_timeout: Duration::from_secs(5),
            thumbnail_size: 256,
        }
    }
}

/// Summary of the adapter a context ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterProfile {
    pub name: String,
    pub backend: wgpu::Backend,
    pub device_type: wgpu::DeviceType,
    pub driver: String,
    pub max_texture_dimension_2d: u32,
    pub max_buffer_size: u64,
}

impl AdapterProfile {
    pub fn from_wgpu(info: &wgpu::AdapterInfo, limits: &wgpu::Limits) -> Self {
        Self {
            name: info.name.clone(),
            backend: info.backend,
            device_type: info.device_type,
            driver: info.driver.clone(),
            max_texture_dimension_2d: limits.max_texture_dimension_2d,
            max_buffer_size: limits.max_buffer_size,
        }
    }

    pub fn is_software(&self) -> bool {
        matches!(self.device_type, wgpu::DeviceType::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dimensions() {
        assert_eq!("512x256".parse::<Dimensions>(), Ok(Dimensions::new(512, 256)));
        assert_eq!(" 64 X 32 ".parse::<Dimensions>(), Ok(Dimensions::new(64, 32)));
        assert!("0x10".parse::<Dimensions>().is_err());
        assert!("wide".parse::<Dimensions>().is_err());
    }

    #[test]
    fn scales_and_fits() {
        let dims = Dimensions::new(800, 600);
        assert_eq!(dims.scaled(2.0), Dimensions::new(1600, 1200));
        assert_eq!(dims.scaled(0.0), dims);
        assert_eq!(dims.fit_within(256), Dimensions::new(256, 192));
        assert_eq!(Dimensions::new(100, 50).fit_within(256), Dimensions::new(100, 50));
        assert_eq!(Dimensions::new(1000, 1).fit_within(10), Dimensions::new(10, 1));
    }

    #[test]
    fn counts_mip_levels() {
        assert_eq!(Dimensions::new(1, 1).mip_level_count(), 1);
        assert_eq!(Dimensions::new(256, 256).mip_level_count(), 9);
        assert_eq!(Dimensions::new(300, 20).mip_level_count(), 9);
    }

    #[test]
    fn selects_execution_case() {
        assert_eq!(ExecutionCase::select(true, true).letter(), 'A');
        assert_eq!(ExecutionCase::select(true, false).letter(), 'B');
        assert_eq!(ExecutionCase::select(false, true).letter(), 'C');
        assert_eq!(ExecutionCase::select(false, false).letter(), 'D');
        assert!(ExecutionCase::SingleWithHistory.uses_history());
        assert!(!ExecutionCase::Iterated.uses_history());
    }
}
