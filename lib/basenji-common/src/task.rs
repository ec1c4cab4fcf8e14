//! Supervised task spawning.
//!
//! Long-running pipeline tasks are wrapped in a supervisor that watches for panics. A task that panics is logged and
//! started again from its factory, while a task that returns normally (or is cancelled) ends supervision. Shared state
//! must therefore live outside the future produced by the factory, typically behind an `Arc`.

use std::future::Future;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument as _};

/// Spawns `make_task()` on the runtime and restarts it every time it panics.
///
/// The returned handle resolves once a spawned instance finishes without panicking.
pub fn spawn_supervised<F, Fut>(name: &'static str, make_task: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(
        async move {
            let mut restarts = 0u64;
            loop {
                let handle = tokio::spawn(make_task().in_current_span());
                match handle.await {
                    Ok(()) => {
                        debug!(task = name, "Task stopped.");
                        break;
                    }
                    Err(e) if e.is_panic() => {
                        restarts += 1;
                        counter!("task_restarts_total", "task" => name).increment(1);
                        error!(task = name, restarts, "Task panicked. Restarting.");
                    }
                    Err(_) => {
                        debug!(task = name, "Task cancelled.");
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    )
}

/// Spawns a task that must never be restarted.
///
/// If the task panics, `on_panic` is invoked with a description of the failure. The watchdog uses this to turn a
/// crashed resource governor into a process exit rather than running unguarded.
pub fn spawn_fatal<Fut, P>(name: &'static str, fut: Fut, on_panic: P) -> JoinHandle<()>
where
    Fut: Future<Output = ()> + Send + 'static,
    P: FnOnce(String) + Send + 'static,
{
    tokio::spawn(
        async move {
            if let Err(e) = tokio::spawn(fut.in_current_span()).await {
                if e.is_panic() {
                    error!(task = name, "Fatal task panicked.");
                    on_panic(format!("task '{}' panicked", name));
                }
            }
        }
        .in_current_span(),
    )
}

pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn panicking_task_is_restarted() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let task_attempts = Arc::clone(&attempts);

        let handle = spawn_supervised("flaky", move || {
            let attempts = Arc::clone(&task_attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("boom");
                }
            }
        });

        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_task_reports_panic() {
        let (tx, rx) = oneshot::channel();
        let handle = spawn_fatal("watchdog", async { panic!("probe failed") }, move |msg| {
            let _ = tx.send(msg);
        });

        handle.await.unwrap();
        assert_eq!(rx.await.unwrap(), "task 'watchdog' panicked");
    }
}
