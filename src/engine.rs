//! Fiber container and thread executor
//!
//! An [`Engine`] hands out [`Fiber`]s and owns the [`Executor`] that drives
//! the asynchronously started ones. It tracks no live fibers: once a driving
//! pass is submitted, the fiber itself carries all remaining state.

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::RwLock;

use crate::fiber::Fiber;

#[cfg(feature = "tracing")]
use tracing::{debug, error, info};

/// A unit of work submitted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Thread-pool capability used by an [`Engine`] to drive fibers.
pub trait Executor: Send + Sync {
    /// Runs the task on some thread, eventually.
    fn execute(&self, task: Task);
}

/// Configuration for the engine's default worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub worker_threads: usize,
    /// Thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpu_count = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_threads: (cpu_count / 2).clamp(2, 8),
            thread_name_prefix: "tube-engine".to_string(),
        }
    }
}

/// Counters for engine activity.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Total fibers created by the engine.
    pub fibers_created: AtomicU64,
    /// Total driving passes submitted to the executor.
    pub passes_submitted: AtomicU64,
    /// Total driving passes that finished executing.
    pub passes_completed: AtomicU64,
    /// Current number of live worker threads in the default pool.
    pub active_workers: AtomicUsize,
}

impl EngineMetrics {
    /// Get snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            fibers_created: self.fibers_created.load(Ordering::Relaxed),
            passes_submitted: self.passes_submitted.load(Ordering::Relaxed),
            passes_completed: self.passes_completed.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of engine metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMetricsSnapshot {
    /// Total fibers created by the engine.
    pub fibers_created: u64,
    /// Total driving passes submitted to the executor.
    pub passes_submitted: u64,
    /// Total driving passes that finished executing.
    pub passes_completed: u64,
    /// Current number of live worker threads in the default pool.
    pub active_workers: usize,
}

/// Collection point for [`Fiber`]s; owns an [`Executor`] to run them.
///
/// Cloning an engine yields another handle to the same engine.
pub struct Engine<P: Send + 'static> {
    inner: Arc<EngineInner<P>>,
}

impl<P: Send + 'static> Clone for Engine<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<P> {
    id: String,
    executor: RwLock<Option<Arc<dyn Executor>>>,
    metrics: Arc<EngineMetrics>,
    _packet: PhantomData<fn(P) -> P>,
}

impl<P: Send + 'static> Engine<P> {
    /// Creates an engine with no executor configured. A default worker pool
    /// is created lazily the first time a fiber is started asynchronously.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                id: id.into(),
                executor: RwLock::new(None),
                metrics: Arc::new(EngineMetrics::default()),
                _packet: PhantomData,
            }),
        }
    }

    /// Creates an engine that drives fibers on the given executor.
    #[must_use]
    pub fn with_executor(id: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        let engine = Self::new(id);
        engine.set_executor(executor);
        engine
    }

    /// Replaces the engine's executor. Fibers submitted from now on run on
    /// the new executor; in-flight passes finish where they are.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.inner.executor.write() = Some(executor);
    }

    /// The engine's identifier, used in thread names and log events.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Get current metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Creates a new fiber in a suspended state.
    ///
    /// To start the returned fiber, call [`Fiber::start`] or
    /// [`Fiber::run_sync`] with the tubeline that should act on the packet.
    #[must_use]
    pub fn create_fiber(&self) -> Fiber<P> {
        self.inner.metrics.fibers_created.fetch_add(1, Ordering::Relaxed);
        Fiber::new(self.clone())
    }

    /// Submits one driving pass for the fiber, creating the default worker
    /// pool first if no executor was configured.
    pub(crate) fn add_runnable(&self, fiber: Fiber<P>) {
        let executor = {
            let configured = self.inner.executor.read().clone();
            match configured {
                Some(executor) => executor,
                None => Arc::clone(self.inner.executor.write().get_or_insert_with(|| {
                    let config = PoolConfig {
                        thread_name_prefix: format!("{}-engine", self.inner.id),
                        ..PoolConfig::default()
                    };
                    Arc::new(WorkerPool::new(config, Arc::clone(&self.inner.metrics)))
                })),
            }
        };

        self.inner.metrics.passes_submitted.fetch_add(1, Ordering::Relaxed);

        let metrics = Arc::clone(&self.inner.metrics);
        executor.execute(Box::new(move || {
            fiber.run_pass();
            metrics.passes_completed.fetch_add(1, Ordering::Relaxed);
        }));
    }
}

/// Default fixed-size worker pool.
///
/// Workers block on a shared submission channel and exit when every sender
/// is gone, so dropping the pool (usually by dropping its engine) drains the
/// queue and winds the threads down.
pub struct WorkerPool {
    task_sender: Sender<Task>,
}

impl WorkerPool {
    /// Creates the pool and spawns its worker threads.
    #[must_use]
    pub fn new(config: PoolConfig, metrics: Arc<EngineMetrics>) -> Self {
        let (task_sender, task_receiver) = channel::unbounded::<Task>();

        #[cfg(feature = "tracing")]
        info!(
            worker_threads = config.worker_threads,
            prefix = %config.thread_name_prefix,
            "initializing engine worker pool"
        );

        for n in 0..config.worker_threads {
            Self::spawn_worker(
                format!("{}-{}", config.thread_name_prefix, n),
                task_receiver.clone(),
                Arc::clone(&metrics),
            );
        }

        Self { task_sender }
    }

    fn spawn_worker(thread_name: String, task_receiver: Receiver<Task>, metrics: Arc<EngineMetrics>) {
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                metrics.active_workers.fetch_add(1, Ordering::AcqRel);

                #[cfg(feature = "tracing")]
                debug!(thread_name = %thread_name, "worker thread started");

                while let Ok(task) = task_receiver.recv() {
                    task();
                }

                metrics.active_workers.fetch_sub(1, Ordering::AcqRel);

                #[cfg(feature = "tracing")]
                debug!(thread_name = %thread_name, "worker thread exiting");
            })
            .expect("Failed to spawn worker thread");
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) {
        if self.task_sender.send(task).is_err() {
            // Only possible when every worker has exited.
            #[cfg(feature = "tracing")]
            error!("failed to submit task: worker pool shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_worker_pool_runs_tasks() {
        let metrics = Arc::new(EngineMetrics::default());
        let pool = WorkerPool::new(
            PoolConfig {
                worker_threads: 2,
                thread_name_prefix: "pool-test".to_string(),
            },
            Arc::clone(&metrics),
        );

        let counter = Arc::new(AtomicU32::new(0));
        let (done_sender, done_receiver) = channel::bounded(5);
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            let done = done_sender.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                let _ = done.send(());
            }));
        }
        for _ in 0..5 {
            done_receiver
                .recv_timeout(Duration::from_secs(5))
                .expect("task ran");
        }

        assert_eq!(counter.load(Ordering::Relaxed), 5);
        // At least the worker that ran the tasks has checked in.
        assert!(metrics.snapshot().active_workers >= 1);
    }

    #[test]
    fn test_engine_counts_fibers() {
        let engine = Engine::<String>::new("count");
        let _one = engine.create_fiber();
        let _two = engine.create_fiber();

        assert_eq!(engine.metrics().fibers_created, 2);
        assert_eq!(engine.metrics().passes_submitted, 0);
    }

    #[test]
    fn test_engine_uses_configured_executor() {
        /// Executor that runs tasks inline on the submitting thread.
        struct Inline(AtomicU32);

        impl Executor for Inline {
            fn execute(&self, task: Task) {
                self.0.fetch_add(1, Ordering::Relaxed);
                task();
            }
        }

        let inline = Arc::new(Inline(AtomicU32::new(0)));
        let engine = Engine::<String>::with_executor("inline", inline.clone());

        let fiber = engine.create_fiber();
        fiber.start(
            crate::tube::tube(EchoStage),
            "ping".to_string(),
            Some(Box::new(|result| {
                assert_eq!(result.unwrap(), "ping");
            })),
        );

        assert_eq!(inline.0.load(Ordering::Relaxed), 1);
        assert_eq!(engine.metrics().passes_submitted, 1);
        assert_eq!(engine.metrics().passes_completed, 1);
        assert!(!fiber.is_alive());
    }

    struct EchoStage;

    impl crate::tube::Tube<String> for EchoStage {
        fn process_request(&mut self, request: String) -> crate::NextAction<String> {
            crate::NextAction::return_with(request)
        }

        fn process_response(&mut self, response: String) -> crate::NextAction<String> {
            crate::NextAction::return_with(response)
        }

        fn process_exception(&mut self, error: crate::Fault) -> crate::NextAction<String> {
            crate::NextAction::throw(error)
        }

        fn copy(
            &self,
            origin: &crate::TubeRef<String>,
            cloner: &mut crate::TubeCloner<String>,
        ) -> crate::TubeRef<String> {
            let copy = crate::tube::tube(EchoStage);
            cloner.add(origin, copy.clone());
            copy
        }
    }
}
