use std::future::Future;
use tokio::task::JoinHandle;
use tracing::Instrument;

pub fn spawn_named<T, F>(name: &'static str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(future.instrument(tracing::info_span!("task", task = name)))
}

pub fn spawn_blocking_named<T, F>(name: &'static str, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::info_span!("task", task = name);
    tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        f()
    })
}
