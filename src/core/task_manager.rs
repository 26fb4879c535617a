/// Spawn a blocking task on the runtime's blocking pool. Serial I/O and the
/// scanner block, so async callers go through here.
pub fn spawn_blocking_task<F, R>(func: F) -> tokio::task::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(func)
}
