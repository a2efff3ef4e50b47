use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::{GpuError, GpuResult};

use super::context::DeviceContext;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Completed,
    /// The timeout elapsed first; the caller carries on as if complete.
    TimedOut,
}

/// Bounds how long the host waits for submitted GPU work.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout: Duration,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: if timeout.is_zero() {
                Duration::from_secs(5)
            } else {
                timeout
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits until everything submitted so far has finished, or the timeout fires.
    pub fn wait(&self, context: &DeviceContext) -> GpuResult<WorkStatus> {
        context.ensure_alive()?;
        let (sender, receiver) = crossbeam_channel::bounded(1);
        context.queue().on_submitted_work_done(move || {
            let _ = sender.send(());
        });

        match self.poll_until(context, &receiver)? {
            Polled::Ready(()) | Polled::Dropped => Ok(WorkStatus::Completed),
            Polled::TimedOut => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_secs_f64() * 1000.0,
                    "GPU work did not finish before the watchdog fired; continuing"
                );
                Ok(WorkStatus::TimedOut)
            }
        }
    }

    /// Polls the device until a GPU callback delivers on `receiver`, bounded
    /// by the timeout. Device loss surfaces as [`GpuError::DeviceLost`].
    pub fn poll_until<T>(
        &self,
        context: &DeviceContext,
        receiver: &Receiver<T>,
    ) -> GpuResult<Polled<T>> {
        let started = Instant::now();
        loop {
            if let Err(err) = context.device().poll(wgpu::PollType::Poll) {
                tracing::debug!(%err, "device poll reported an error");
            }
            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(value) => return Ok(Polled::Ready(value)),
                Err(RecvTimeoutError::Disconnected) => {
                    context.ensure_alive()?;
                    return Ok(Polled::Dropped);
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            if context.is_lost() {
                return Err(GpuError::DeviceLost);
            }
            if started.elapsed() >= self.timeout {
                return Ok(Polled::TimedOut);
            }
        }
    }
}

/// Outcome of [`Watchdog::poll_until`].
#[derive(Debug, PartialEq, Eq)]
pub enum Polled<T> {
    Ready(T),
    /// The callback was dropped without delivering.
    Dropped,
    TimedOut,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_falls_back_to_default() {
        assert_eq!(Watchdog::new(Duration::ZERO).timeout(), Duration::from_secs(5));
        assert_eq!(
            Watchdog::new(Duration::from_millis(250)).timeout(),
            Duration::from_millis(250)
        );
    }
}
