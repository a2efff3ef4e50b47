//! Buffer pooling keyed by `(size, usage)`.
//!
//! Handed-out buffers stay registered with `in_use = true` so a second
//! `allocate` can never return the same buffer twice. Releasing marks the
//! entry idle; idle entries older than `max_age` are destroyed by `cleanup`.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{GpuError, GpuResult};

use super::context::DeviceContext;
use super::scope;
use super::watchdog::{Polled, Watchdog};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

/// A buffer handed out by the pool. Give it back with [`BufferPool::release`].
#[derive(Debug)]
pub struct PooledBuffer {
    id: u64,
    key: BufferKey,
    buffer: wgpu::Buffer,
}

impl PooledBuffer {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn key(&self) -> BufferKey {
        self.key
    }

    pub fn size(&self) -> u64 {
        self.key.size
    }
}

#[derive(Debug)]
struct PoolEntry {
    id: u64,
    buffer: wgpu::Buffer,
    last_used: Instant,
    in_use: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub pooled: usize,
    pub in_use: usize,
    pub bytes: u64,
}

pub struct BufferPool {
    context: DeviceContext,
    entries: HashMap<BufferKey, Vec<PoolEntry>>,
    max_per_key: usize,
    max_age: Duration,
    watchdog: Watchdog,
}

impl BufferPool {
    pub fn new(context: DeviceContext, max_per_key: usize, max_age: Duration) -> Self {
        Self {
            context,
            entries: HashMap::new(),
            max_per_key: max_per_key.max(1),
            max_age,
            watchdog: Watchdog::default(),
        }
    }

    /// Bounds how long [`BufferPool::read`] waits for the mapping.
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Hands out an idle pooled buffer of identical size and usage, or a new one.
    pub fn allocate(&mut self, size: u64, usage: wgpu::BufferUsages) -> GpuResult<PooledBuffer> {
        self.context.ensure_alive()?;
        let key = BufferKey { size, usage };
        if let Some(entry) = self
            .entries
            .get_mut(&key)
            .and_then(|entries| entries.iter_mut().find(|entry| !entry.in_use))
        {
            entry.in_use = true;
            entry.last_used = Instant::now();
            return Ok(PooledBuffer {
                id: entry.id,
                key,
                buffer: entry.buffer.clone(),
            });
        }

        let buffer = self.create(key)?;
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.entry(key).or_default();
        if entries.len() < self.max_per_key {
            entries.push(PoolEntry {
                id,
                buffer: buffer.clone(),
                last_used: Instant::now(),
                in_use: true,
            });
        }
        Ok(PooledBuffer { id, key, buffer })
    }

    /// Returns a buffer to the pool, destroying it when the key is full.
    pub fn release(&mut self, handle: PooledBuffer) {
        let entries = self.entries.entry(handle.key).or_default();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.id == handle.id) {
            if !entry.in_use {
                tracing::warn!(size = handle.key.size, "buffer released twice");
            }
            entry.in_use = false;
            entry.last_used = Instant::now();
            return;
        }
        if entries.len() < self.max_per_key {
            entries.push(PoolEntry {
                id: handle.id,
                buffer: handle.buffer,
                last_used: Instant::now(),
                in_use: false,
            });
        } else {
            tracing::debug!(
                size = handle.key.size,
                usage = ?handle.key.usage,
                "pool full for key; destroying released buffer"
            );
            handle.buffer.destroy();
        }
    }

    /// Destroys idle entries last used more than `max_age` before `now`.
    pub fn cleanup(&mut self, now: Instant) -> usize {
        let max_age = self.max_age;
        let mut evicted = 0;
        for entries in self.entries.values_mut() {
            entries.retain(|entry| {
                let stale =
                    !entry.in_use && now.saturating_duration_since(entry.last_used) > max_age;
                if stale {
                    entry.buffer.destroy();
                    evicted += 1;
                }
                !stale
            });
        }
        self.entries.retain(|_, entries| !entries.is_empty());
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle pooled buffers");
        }
        evicted
    }

    /// Destroys every idle entry regardless of age.
    pub fn clear(&mut self) {
        for entries in self.entries.values_mut() {
            entries.retain(|entry| {
                if !entry.in_use {
                    entry.buffer.destroy();
                }
                entry.in_use
            });
        }
        self.entries.retain(|_, entries| !entries.is_empty());
    }

    pub fn stats(&self) -> PoolStats {
        self.entries
            .iter()
            .flat_map(|(key, entries)| entries.iter().map(move |entry| (key.size, entry.in_use)))
            .fold(PoolStats::default(), |mut stats, (size, in_use)| {
                stats.pooled += 1;
                stats.bytes += size;
                if in_use {
                    stats.in_use += 1;
                }
                stats
            })
    }

    /// Copies `size` bytes at `offset` out of `buffer` through a staging buffer.
    ///
    /// `buffer` needs `COPY_SRC`; offset and size must be multiples of 4.
    pub fn read(&self, buffer: &wgpu::Buffer, offset: u64, size: u64) -> GpuResult<Vec<u8>> {
        read_buffer(&self.context, &self.watchdog, buffer, offset, size)
    }

    fn create(&self, key: BufferKey) -> GpuResult<wgpu::Buffer> {
        let limit = self.context.adapter_profile().max_buffer_size;
        if key.size == 0 || key.size > limit {
            return Err(GpuError::Allocation {
                size: key.size,
                reason: format!("size must be between 1 and {limit} bytes"),
            });
        }
        let device = self.context.device();
        let (buffer, error) = scope::capture(device, || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("pooled buffer"),
                size: key.size,
                usage: key.usage,
                mapped_at_creation: false,
            })
        });
        match error {
            Some(err) => Err(GpuError::Allocation {
                size: key.size,
                reason: scope::describe(&err),
            }),
            None => Ok(buffer),
        }
    }
}

pub(crate) fn read_buffer(
    context: &DeviceContext,
    watchdog: &Watchdog,
    buffer: &wgpu::Buffer,
    offset: u64,
    size: u64,
) -> GpuResult<Vec<u8>> {
    context.ensure_alive()?;
    if size == 0 {
        return Ok(Vec::new());
    }
    if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
        return Err(GpuError::Readback(format!(
            "offset {offset} and size {size} must be multiples of {}",
            wgpu::COPY_BUFFER_ALIGNMENT
        )));
    }
    if offset.saturating_add(size) > buffer.size() {
        return Err(GpuError::Readback(format!(
            "range {offset}..{} exceeds buffer size {}",
            offset + size,
            buffer.size()
        )));
    }

    let device = context.device();
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let (_, error) = scope::capture(device, || {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback copy"),
        });
        encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, size);
        context.queue().submit(Some(encoder.finish()));
    });
    if let Some(err) = error {
        staging.destroy();
        return Err(GpuError::Readback(scope::describe(&err)));
    }

    let slice = staging.slice(..);
    let (sender, receiver) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    let mapped = match watchdog.poll_until(context, &receiver) {
        Ok(Polled::Ready(result)) => {
            result.map_err(|err| GpuError::Readback(format!("buffer mapping failed: {err}")))
        }
        Ok(Polled::Dropped) => Err(GpuError::Readback("map callback was dropped".into())),
        Ok(Polled::TimedOut) => {
            tracing::warn!(
                size,
                timeout_ms = watchdog.timeout().as_secs_f64() * 1000.0,
                "buffer mapping did not finish before the watchdog fired"
            );
            Err(GpuError::ReadbackTimedOut(watchdog.timeout()))
        }
        Err(err) => Err(err),
    };
    if let Err(err) = mapped {
        staging.destroy();
        context.ensure_alive()?;
        return Err(err);
    }

    let bytes = slice.get_mapped_range().to_vec();
    staging.unmap();
    staging.destroy();
    Ok(bytes)
}
