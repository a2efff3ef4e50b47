//! GPU-side building blocks.
//!
//! - `context` negotiates the adapter/device once and hands out cheap clones.
//! - `pool` recycles buffers by `(size, usage)` and owns staging readback.
//! - `pipeline` builds bind group layouts from capability flags and caches
//!   compute pipelines by `(label, entry point)`.
//! - `executor` encodes and submits dispatches; `watchdog` bounds the wait.
//! - `feedback` runs the ping-pong iteration protocol.
//! - `prepare` assembles everything a shader needs at one resolution.
//! - `animation` drives per-shader loops over the four execution cases.
//! - `postprocess`, `mipmap`, `present` and `export` turn compute output into
//!   display textures or host images.

pub mod animation;
pub mod context;
pub mod executor;
pub mod export;
pub mod feedback;
pub mod mipmap;
pub mod pipeline;
pub mod pool;
pub mod postprocess;
pub mod prepare;
pub mod present;
pub(crate) mod scope;
pub mod textures;
pub mod uniforms;
pub mod watchdog;
