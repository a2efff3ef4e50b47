/// Runs `work` inside validation and out-of-memory error scopes.
///
/// Returns the work's result together with the first GPU error raised while
/// it ran. Without the scopes these errors would only reach the uncaptured
/// error handler.
pub(crate) fn capture<T>(device: &wgpu::Device, work: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

    let result = work();

    let out_of_memory = pollster::block_on(device.pop_error_scope());
    let validation = pollster::block_on(device.pop_error_scope());

    (result, validation.or(out_of_memory))
}

/// Flattens a GPU error into a single line for diagnostics.
pub(crate) fn describe(error: &wgpu::Error) -> String {
    match error {
        wgpu::Error::Validation { description, .. } => description.trim().to_string(),
        wgpu::Error::OutOfMemory { .. } => "out of GPU memory".to_string(),
        other => other.to_string(),
    }
}
