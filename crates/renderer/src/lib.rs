//! GPU compute-shader orchestration for shadelab.
//!
//! Shaders are WGSL compute programs that write an `rgba16float` storage
//! texture. The crate compiles them, binds the conventional group 0 slots,
//! dispatches them once or as per-shader animation loops, and post-processes
//! the result into display textures or exported images without moving pixels
//! through the host until the final readback:
//!
//! ```text
//!   source ─▶ ShaderCompiler ─▶ PipelineBuilder ─▶ prepare() ─▶ PreparedShader
//!                                                        │
//!                      ┌─────────────────────────────────┴───────┐
//!                      ▼                                         ▼
//!               Renderer::render                     AnimationController
//!                      │                          (cases A/B/C/D per frame)
//!                      └──────────────┬──────────────────────────┘
//!                                     ▼
//!                               PostProcessor ─▶ CanvasPresenter / ResultRenderer
//! ```
//!
//! Bind group 0: `0` frame uniforms, `1` output storage texture, `2` optional
//! parameter uniform, `3`/`4` optional previous-frame texture and sampler.

mod compile;
mod engine;
mod error;
pub mod gpu;
mod params;
mod types;

pub use compile::{detect_bindings, slots, CompiledProgram, ShaderBindings, ShaderCompiler};
pub use engine::{RenderRequest, Renderer};
pub use error::{CompileFailure, Diagnostic, GpuError, GpuResult};
pub use gpu::animation::{AnimationObserver, AnimationOptions, TickReport};
pub use gpu::context::{AttachedSurface, Capabilities, DeviceContext};
pub use gpu::executor::workgroup_count;
pub use gpu::export::{encode_png, ExportSource, SourceRect};
pub use gpu::pipeline::{CachePolicy, LayoutFlags};
pub use gpu::pool::PoolStats;
pub use gpu::postprocess::ProcessedFrame;
pub use gpu::prepare::{PrepareOptions, PreparedShader};
pub use gpu::present::PresentPath;
pub use gpu::textures::TrackedTexture;
pub use params::{
    pack_parameters, param_buffer_size, ParameterBuffer, ParameterValues, DUMMY_PARAM_BUFFER_SIZE,
};
pub use scheduler::QualityPolicy;
pub use types::{
    AdapterProfile, DeviceOptions, Dimensions, ExecutionCase, FrameProfile, GpuMemoryMode,
    GpuPowerPreference, RendererOptions, DISPLAY_FORMAT, STORAGE_FORMAT, WORKGROUP_TILE,
};

/// Texture labels whose live counts are tracked on the context.
pub mod labels {
    pub use crate::gpu::textures::{FEEDBACK_LABEL, PING_PONG_LABEL};
}
