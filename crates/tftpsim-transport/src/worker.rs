//! Start/stop-controlled poll loop.
//!
//! A [`Worker`] runs one "unit of work" closure over and over on its own
//! Tokio task until the unit asks to stop or [`Worker::stop`] is called.
//! Servers and relays use it for their request-accept loops: a unit
//! receives one request and spawns whatever handles it, so stopping the
//! worker only prevents new work from starting.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the loop should do after a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run another unit
    Continue,
    /// Leave the loop
    Stop,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker task panicked or was aborted
    #[error("worker '{name}' terminated abnormally: {reason}")]
    Terminated {
        /// Worker name
        name: String,
        /// Join error description
        reason: String,
    },
}

/// Worker statistics
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Units that completed without error
    pub units_completed: AtomicU64,
    /// Units that returned an error
    pub errors: AtomicU64,
}

impl WorkerStats {
    /// Units that completed without error
    pub fn completed(&self) -> u64 {
        self.units_completed.load(Ordering::Relaxed)
    }

    /// Units that returned an error
    pub fn failed(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// A named poll loop running on its own task
pub struct Worker {
    name: String,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    stats: Arc<WorkerStats>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn a worker driving `unit` until it returns [`Step::Stop`] or
    /// the worker is stopped.
    ///
    /// Errors returned by a unit are logged and counted; the loop keeps
    /// going. A unit that cannot make progress any more should return
    /// `Ok(Step::Stop)`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F, Fut, E>(name: impl Into<String>, mut unit: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Step, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let name = name.into();
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let stats = Arc::new(WorkerStats::default());

        let handle = {
            let name = name.clone();
            let shutdown = shutdown.clone();
            let wake = wake.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                debug!(worker = %name, "worker starting");

                while !shutdown.load(Ordering::Acquire) {
                    tokio::select! {
                        biased;
                        () = wake.notified() => break,
                        result = unit() => match result {
                            Ok(step) => {
                                stats.units_completed.fetch_add(1, Ordering::Relaxed);
                                if step == Step::Stop {
                                    break;
                                }
                            }
                            Err(e) => {
                                stats.errors.fetch_add(1, Ordering::Relaxed);
                                warn!(worker = %name, "unit of work failed: {e}");
                            }
                        },
                    }
                }

                info!(worker = %name, "worker stopped");
            })
        };

        Self {
            name,
            shutdown,
            wake,
            stats,
            handle,
        }
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to exit. An in-flight unit is abandoned at its next
    /// await point; work it already spawned is unaffected.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        // notify_one stores a permit when no one is waiting yet
        self.wake.notify_one();
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Loop statistics
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Wait for the loop to exit.
    ///
    /// # Errors
    /// Returns `WorkerError::Terminated` if the task panicked.
    pub async fn join(self) -> Result<(), WorkerError> {
        self.handle.await.map_err(|e| WorkerError::Terminated {
            name: self.name,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_worker_runs_until_unit_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = {
            let counter = counter.clone();
            Worker::spawn("counter", move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok::<_, String>(if n == 3 { Step::Stop } else { Step::Continue })
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(1), worker.join())
            .await
            .expect("worker did not stop")
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_worker_stop_interrupts_blocked_unit() {
        let worker = Worker::spawn("sleeper", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(Step::Continue)
        });
        assert!(worker.is_running());

        worker.stop();
        tokio::time::timeout(Duration::from_secs(1), worker.join())
            .await
            .expect("worker ignored stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_counts_errors_and_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = {
            let calls = calls.clone();
            Worker::spawn("flaky", move || {
                let calls = calls.clone();
                async move {
                    match calls.fetch_add(1, Ordering::SeqCst) {
                        0 | 1 => Err("transient"),
                        _ => Ok(Step::Stop),
                    }
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.stats().failed(), 2);
        assert_eq!(worker.stats().completed(), 1);
        worker.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_stop_before_first_poll() {
        let worker = Worker::spawn("idle", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(Step::Continue)
        });
        worker.stop();
        worker.stop();
        assert_eq!(worker.name(), "idle");
        tokio::time::timeout(Duration::from_secs(1), worker.join())
            .await
            .unwrap()
            .unwrap();
    }
}
