//! Bounded fork/join of extraction sub-tasks.
//!
//! Sub-tasks are grouped into batches of at most `batch-size` slots. Each
//! batch is forked onto a work-stealing pool as soon as it is full, where it
//! forks all of its members and joins them all before reporting back. Later
//! batches can be built and forked while earlier ones still run; batches are
//! joined in the order they were forked.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver};
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::config::{ConfigError, ConfigNode};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

type Job<E> = Box<dyn FnOnce() -> Result<(), E> + Send + 'static>;

/// One unit of work with a label used in reports.
pub struct Task<E> {
    label: String,
    job: Job<E>,
}

impl<E> Task<E> {
    pub fn new<F>(label: impl Into<String>, job: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
    {
        Self {
            label: label.into(),
            job: Box::new(job),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<E> fmt::Debug for Task<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("label", &self.label).finish()
    }
}

/// An ordered, size-bounded list of tasks forked and joined as a unit.
///
/// Skipped tasks (ones that could not be constructed) still take a slot.
#[derive(Debug)]
pub struct Batch<E> {
    index: usize,
    tasks: Vec<Task<E>>,
    slots: usize,
}

impl<E> Batch<E> {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            tasks: Vec::new(),
            slots: 0,
        }
    }

    pub fn push(&mut self, task: Task<E>) {
        self.tasks.push(task);
        self.slots += 1;
    }

    /// Account for a task that could not be constructed.
    pub fn skip(&mut self) {
        self.slots += 1;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// A member of a batch that did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub label: String,
    pub reason: String,
}

/// Outcome of one joined batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub index: usize,
    /// Members forked
    pub size: usize,
    /// Slots consumed, including skipped members
    pub slots: usize,
    /// Labels of successful members, in submission order
    pub succeeded: Vec<String>,
    pub failed: Vec<TaskFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Pending result of a forked batch.
#[derive(Debug)]
pub struct BatchHandle {
    index: usize,
    slots: usize,
    labels: Vec<String>,
    done: Receiver<BatchReport>,
}

impl BatchHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Block until the batch has finished.
    ///
    /// Never fails: member errors and panics are part of the report. Must
    /// not be called from a thread of the coordinator's own pool.
    pub fn join(self) -> BatchReport {
        match self.done.recv() {
            Ok(report) => report,
            Err(_) => {
                tracing::error!("Batch {} worker exited without reporting", self.index);
                BatchReport {
                    index: self.index,
                    size: self.labels.len(),
                    slots: self.slots,
                    succeeded: Vec::new(),
                    failed: self
                        .labels
                        .into_iter()
                        .map(|label| TaskFailure {
                            label,
                            reason: "batch worker exited without reporting".to_string(),
                        })
                        .collect(),
                }
            }
        }
    }
}

/// Forks batches of tasks onto a rayon pool.
#[derive(Clone)]
pub struct BatchCoordinator {
    pool: Arc<ThreadPool>,
    batch_size: Option<usize>,
}

impl fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("threads", &self.pool.current_num_threads())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl BatchCoordinator {
    /// `threads = None` uses rayon's default; `batch_size = None` is unbounded.
    pub fn new(threads: Option<usize>, batch_size: Option<usize>) -> Result<Self, BatchError> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("extract-{}", i));
        if let Some(threads) = threads.filter(|n| *n > 0) {
            builder = builder.num_threads(threads);
        }

        Ok(Self {
            pool: Arc::new(builder.build()?),
            batch_size: batch_size.filter(|n| *n > 0),
        })
    }

    /// Read `threads` and `batch-size` from the configuration.
    pub fn from_config(config: &ConfigNode) -> Result<Self, BatchError> {
        let threads = config.parse::<usize>("threads")?;
        let batch_size = config.get_bound("batch-size")?;
        Self::new(threads, batch_size)
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn is_full<E>(&self, batch: &Batch<E>) -> bool {
        self.batch_size.is_some_and(|size| batch.slots() >= size)
    }

    /// Spawn `batch` onto the pool and return immediately.
    pub fn fork<E>(&self, batch: Batch<E>) -> BatchHandle
    where
        E: fmt::Display + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let handle = BatchHandle {
            index: batch.index,
            slots: batch.slots,
            labels: batch.tasks.iter().map(|t| t.label.clone()).collect(),
            done: rx,
        };

        tracing::debug!(
            "Forking batch {} with {} task(s) ({} slot(s))",
            batch.index,
            batch.tasks.len(),
            batch.slots
        );

        self.pool.spawn(move || {
            let report = run_batch(batch);
            let _ = tx.send(report);
        });

        handle
    }

    /// Fork tasks in batches as they are produced, then join every batch in
    /// submission order.
    ///
    /// A `None` item is a task that could not be constructed: it takes a slot
    /// but is not run. Empty batches are not forked.
    pub fn run<E, I>(&self, tasks: I) -> Vec<BatchReport>
    where
        E: fmt::Display + Send + 'static,
        I: IntoIterator<Item = Option<Task<E>>>,
    {
        let mut handles = Vec::new();
        let mut batch = Batch::new(0);

        for task in tasks {
            match task {
                Some(task) => batch.push(task),
                None => batch.skip(),
            }

            if self.is_full(&batch) {
                let next = Batch::new(batch.index + 1);
                let full = std::mem::replace(&mut batch, next);
                if full.is_empty() {
                    tracing::debug!("Batch {} has no runnable tasks, not forking", full.index);
                } else {
                    handles.push(self.fork(full));
                }
            }
        }

        if !batch.is_empty() {
            handles.push(self.fork(batch));
        }

        handles
            .into_iter()
            .map(|handle| {
                let report = handle.join();
                tracing::debug!(
                    "Joined batch {}: {} succeeded, {} failed",
                    report.index,
                    report.succeeded.len(),
                    report.failed.len()
                );
                report
            })
            .collect()
    }
}

/// Fork every member, join them all, report in submission order.
fn run_batch<E>(batch: Batch<E>) -> BatchReport
where
    E: fmt::Display + Send + 'static,
{
    let Batch { index, tasks, slots } = batch;
    let size = tasks.len();
    let (tx, rx) = unbounded();

    rayon::scope(|scope| {
        for (position, task) in tasks.into_iter().enumerate() {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let Task { label, job } = task;
                let outcome = run_task(&label, job);
                let _ = tx.send((position, label, outcome));
            });
        }
    });
    drop(tx);

    let mut outcomes: Vec<_> = rx.try_iter().collect();
    outcomes.sort_by_key(|(position, _, _)| *position);

    let mut report = BatchReport {
        index,
        size,
        slots,
        ..BatchReport::default()
    };
    for (_, label, outcome) in outcomes {
        match outcome {
            Ok(()) => report.succeeded.push(label),
            Err(reason) => report.failed.push(TaskFailure { label, reason }),
        }
    }
    report
}

fn run_task<E: fmt::Display>(label: &str, job: Job<E>) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::warn!("Task {} failed: {}", label, e);
            Err(e.to_string())
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Task {} panicked: {}", label, message);
            Err(format!("panicked: {}", message))
        }
    }
}
