use std::time::{Duration, Instant};

use crate::error::{GpuError, GpuResult};
use crate::types::Dimensions;

use super::context::DeviceContext;
use super::scope;
use super::watchdog::{Watchdog, WorkStatus};

/// Number of workgroups needed to cover `dimensions` with `tile`-sized groups.
pub fn workgroup_count(dimensions: Dimensions, tile: [u32; 3]) -> (u32, u32, u32) {
    let tile_x = tile[0].max(1);
    let tile_y = tile[1].max(1);
    (
        dimensions.width.div_ceil(tile_x),
        dimensions.height.div_ceil(tile_y),
        1,
    )
}

/// Everything one compute dispatch needs.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub pipeline: &'a wgpu::ComputePipeline,
    pub bind_group: &'a wgpu::BindGroup,
    pub workgroups: (u32, u32, u32),
    pub label: &'a str,
}

/// Outcome of a submitted dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    pub status: WorkStatus,
    /// Wall-clock time from encoding until the wait returned.
    pub elapsed: Duration,
}

/// Encodes, submits and waits for compute dispatches.
#[derive(Debug, Clone)]
pub struct Executor {
    context: DeviceContext,
    watchdog: Watchdog,
}

impl Executor {
    pub fn new(context: DeviceContext, watchdog: Watchdog) -> Self {
        Self { context, watchdog }
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Records a compute pass for `dispatch` into `encoder`.
    pub fn encode(encoder: &mut wgpu::CommandEncoder, dispatch: &DispatchContext<'_>) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(dispatch.label),
            timestamp_writes: None,
        });
        pass.set_pipeline(dispatch.pipeline);
        pass.set_bind_group(0, dispatch.bind_group, &[]);
        let (x, y, z) = dispatch.workgroups;
        pass.dispatch_workgroups(x, y, z);
    }

    /// Submits one dispatch and waits for it.
    pub fn execute(&self, dispatch: &DispatchContext<'_>) -> GpuResult<Execution> {
        self.execute_multiple(std::slice::from_ref(dispatch))
    }

    /// Submits independent dispatches as separate command buffers in a single
    /// queue submission and waits for all of them.
    pub fn execute_multiple(&self, dispatches: &[DispatchContext<'_>]) -> GpuResult<Execution> {
        self.context.ensure_alive()?;
        if dispatches.is_empty() {
            return Ok(Execution {
                status: WorkStatus::Completed,
                elapsed: Duration::ZERO,
            });
        }

        let started = Instant::now();
        let device = self.context.device();
        let (_, error) = scope::capture(device, || {
            let buffers = dispatches.iter().map(|dispatch| {
                let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(dispatch.label),
                });
                Self::encode(&mut encoder, dispatch);
                encoder.finish()
            });
            self.context.queue().submit(buffers);
        });
        if let Some(err) = error {
            return Err(GpuError::Execution(scope::describe(&err)));
        }

        let status = self.wait()?;
        let elapsed = started.elapsed();
        tracing::trace!(
            dispatches = dispatches.len(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "compute dispatch finished"
        );
        Ok(Execution { status, elapsed })
    }

    /// Submits a finished encoder inside an error scope without waiting.
    pub fn submit(&self, encoder: wgpu::CommandEncoder) -> GpuResult<wgpu::SubmissionIndex> {
        submit_encoder(&self.context, encoder)
    }

    /// Waits for everything submitted so far, bounded by the watchdog.
    pub fn wait(&self) -> GpuResult<WorkStatus> {
        self.watchdog.wait(&self.context)
    }
}

pub(crate) fn submit_encoder(
    context: &DeviceContext,
    encoder: wgpu::CommandEncoder,
) -> GpuResult<wgpu::SubmissionIndex> {
    context.ensure_alive()?;
    let (index, error) = scope::capture(context.device(), || {
        context.queue().submit(Some(encoder.finish()))
    });
    match error {
        Some(err) => Err(GpuError::Execution(scope::describe(&err))),
        None => Ok(index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WORKGROUP_TILE;

    #[test]
    fn workgroups_cover_every_pixel() {
        assert_eq!(
            workgroup_count(Dimensions::new(512, 512), WORKGROUP_TILE),
            (64, 64, 1)
        );
        assert_eq!(
            workgroup_count(Dimensions::new(513, 512), WORKGROUP_TILE),
            (65, 64, 1)
        );
        assert_eq!(workgroup_count(Dimensions::new(1, 1), WORKGROUP_TILE), (1, 1, 1));
    }

    #[test]
    fn custom_tiles_are_respected() {
        assert_eq!(
            workgroup_count(Dimensions::new(100, 30), [16, 4, 1]),
            (7, 8, 1)
        );
        assert_eq!(workgroup_count(Dimensions::new(10, 10), [0, 0, 1]), (10, 10, 1));
    }
}
