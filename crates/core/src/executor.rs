use std::future::Future;
use std::sync::LazyLock;

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;

// Only built when a task is spawned from outside any tokio runtime.
static FALLBACK_RT: LazyLock<Option<Runtime>> = LazyLock::new(TaskExecutor::initialize_fallback_rt);

/// Handle to the runtime a controller or timer spawns its background work on.
///
/// Each component owns its own handle so tests can inject a paused or single threaded runtime
/// instead of sharing one process wide pool.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use holdback::executor::TaskExecutor;
/// let executor = TaskExecutor::current();
/// let answer = executor.spawn(async { 42 }).await.unwrap();
/// assert_eq!(answer, 42);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct TaskExecutor {
    handle: Handle,
}

impl TaskExecutor {
    /// Uses the runtime the caller is running on, or a lazily built fallback runtime when
    /// called from plain threads.
    pub fn current() -> Self {
        if let Ok(handle) = Handle::try_current() {
            return Self { handle };
        }
        match &*FALLBACK_RT {
            Some(rt) => {
                tracing::warn!("TaskExecutor: no ambient runtime, using fallback runtime");
                Self {
                    handle: rt.handle().clone(),
                }
            }
            None => unreachable!("fallback runtime is built whenever no ambient runtime exists"),
        }
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    #[inline]
    pub fn spawn<R: Send + 'static>(
        &self,
        f: impl Future<Output = R> + Send + 'static,
    ) -> JoinHandle<R> {
        self.handle.spawn(f)
    }

    fn initialize_fallback_rt() -> Option<Runtime> {
        if Handle::try_current().is_ok() {
            tracing::debug!("TaskExecutor: runtime exists");
            return None;
        }
        tracing::warn!("TaskExecutor: creating fallback runtime");
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("holdback-worker");
        if cfg!(debug_assertions) {
            builder.worker_threads(2).max_blocking_threads(2);
        }
        Some(builder.build().expect("failed to build tokio runtime"))
    }
}
