//! Helpers for testing the scheduler.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The snapshot writer creates the directory again lazily after
//!    it has been deleted, which would leak it. Assign it to a variable in the test function
//!    (e.g. `let snapshot_dir = test::tempdir()`).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the batcher crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("batcher=trace,batcher_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Counts how often producers created through it actually ran.
///
/// Producers also track how many of them are running at the same time, which is used to check
/// concurrency limits.
#[derive(Debug, Clone, Default)]
pub struct Producers {
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl Producers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of producers that were invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The highest number of producers that were running at the same time.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// A producer that sleeps for `delay` and then resolves to `value`.
    pub fn returning<T>(
        &self,
        value: T,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send + use<T>
    where
        T: Send + 'static,
    {
        self.producing(delay, move || Ok(value))
    }

    /// A producer that sleeps for `delay` and then fails with `message`.
    pub fn failing<T>(
        &self,
        message: &'static str,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send + use<T>
    where
        T: Send + 'static,
    {
        self.producing(delay, move || Err(anyhow::anyhow!(message)))
    }

    fn producing<T, F>(
        &self,
        delay: Duration,
        result: F,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send + use<T, F>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let this = self.clone();
        move || {
            async move {
                this.calls.fetch_add(1, Ordering::SeqCst);
                let now = this.running.fetch_add(1, Ordering::SeqCst) + 1;
                this.max_running.fetch_max(now, Ordering::SeqCst);

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                this.running.fetch_sub(1, Ordering::SeqCst);
                result()
            }
            .boxed()
        }
    }
}
