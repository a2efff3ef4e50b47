//! Ping-pong iteration of one shader over a pair of temporary textures.
//!
//! For iteration `i` the "current" texture is A when `i` is even and B when it
//! is odd; the other one is "previous" and is what the shader samples. After
//! every iteration but the last, the shared output is copied into "current" so
//! it becomes "previous" for the next pass. B starts as a copy of the seed, or
//! black without one.
//!
//! Both textures are [`TrackedTexture`]s owned by [`FeedbackLoop::run`], so they
//! are destroyed when it returns no matter how it returns.
use crate::error::{GpuError, GpuResult};
use crate::types::{Dimensions, STORAGE_FORMAT};

use super::context::DeviceContext;
use super::executor::submit_encoder;
use super::textures::{
    copy_whole, encode_clear, linear_sampler, storage_descriptor, TrackedTexture, HISTORY_USAGE,
    PING_PONG_LABEL,
};

/// What the per-iteration callback gets to read.
pub struct FeedbackIteration<'a> {
    pub index: u32,
    pub total: u32,
    pub previous: &'a wgpu::TextureView,
    pub sampler: &'a wgpu::Sampler,
}

impl FeedbackIteration<'_> {
    pub fn is_final(&self) -> bool {
        self.index + 1 == self.total
    }
}

pub struct FeedbackLoop {
    context: DeviceContext,
    sampler: wgpu::Sampler,
}

impl FeedbackLoop {
    pub fn new(context: DeviceContext) -> Self {
        let sampler = linear_sampler(context.device(), "feedback sampler");
        Self { context, sampler }
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    /// Runs `iterations` passes (at least one) and submits them as one command buffer.
    ///
    /// `callback` must record a pass that writes `output`. The output texture
    /// needs `COPY_SRC` and the storage format; a seed must match both size and
    /// format.
    pub fn run<F>(
        &self,
        dimensions: Dimensions,
        iterations: u32,
        output: &wgpu::Texture,
        seed: Option<&wgpu::Texture>,
        mut callback: F,
    ) -> GpuResult<wgpu::SubmissionIndex>
    where
        F: FnMut(&FeedbackIteration<'_>, &mut wgpu::CommandEncoder) -> GpuResult<()>,
    {
        let total = iterations.max(1);
        if let Some(seed) = seed {
            let seed_dims = Dimensions::new(seed.width(), seed.height());
            if seed_dims != dimensions || seed.format() != STORAGE_FORMAT {
                return Err(GpuError::Execution(format!(
                    "feedback seed is {seed_dims} {:?}, expected {dimensions} {STORAGE_FORMAT:?}",
                    seed.format()
                )));
            }
        }

        let descriptor =
            storage_descriptor("feedback ping-pong", dimensions, STORAGE_FORMAT, HISTORY_USAGE);
        let a = self.context.create_texture(PING_PONG_LABEL, &descriptor)?;
        let b = self.context.create_texture(PING_PONG_LABEL, &descriptor)?;

        let mut encoder =
            self.context
                .device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("feedback loop"),
                });
        match seed {
            Some(seed) => copy_whole(&mut encoder, seed, b.texture(), dimensions),
            None => encode_clear(&mut encoder, b.view()),
        }

        for index in 0..total {
            let (current, previous): (&TrackedTexture, &TrackedTexture) =
                match current_slot(index) {
                    'A' => (&a, &b),
                    _ => (&b, &a),
                };
            let iteration = FeedbackIteration {
                index,
                total,
                previous: previous.view(),
                sampler: &self.sampler,
            };
            callback(&iteration, &mut encoder)?;
            if !iteration.is_final() {
                copy_whole(&mut encoder, output, current.texture(), dimensions);
            }
        }

        let index = submit_encoder(&self.context, encoder)?;
        tracing::trace!(iterations = total, %dimensions, "feedback loop submitted");
        Ok(index)
    }
}

/// Which ping-pong texture is "current" for iteration `index`.
pub fn current_slot(index: u32) -> char {
    if index % 2 == 0 {
        'A'
    } else {
        'B'
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_alternates_starting_with_a() {
        let slots: String = (0..5).map(current_slot).collect();
        assert_eq!(slots, "ABABA");
    }
}
