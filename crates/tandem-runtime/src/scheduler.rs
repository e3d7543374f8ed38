//! Main-loop scheduler
//!
//! The script thread owns a `Scheduler` and runs posted tasks from its own
//! loop. Any thread may hold a `SchedulerHandle` and post work to it; this is
//! the only cross-thread entry point into the host.
//!
//! Posting fails once the scheduler has shut down. Callers treat that as the
//! signal to discard the task, not to retry.

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// A ready-to-run unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct Scheduler {
    rx: UnboundedReceiver<Task>,
    tx: UnboundedSender<Task>,
}

/// Cloneable, thread-safe handle used to post tasks to a `Scheduler`.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: UnboundedSender<Task>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { rx, tx }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run queued tasks, including ones posted while running, until none are
    /// left. Returns how many ran.
    pub fn run_until_idle(&mut self) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        ran
    }

    /// Stop accepting tasks and drop any that are still queued.
    ///
    /// Every `post` after this returns `false`.
    pub fn shutdown(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while let Ok(task) = self.rx.try_recv() {
            drop(task);
            discarded += 1;
        }
        log::debug!("Scheduler shut down, {} queued task(s) discarded", discarded);
        discarded
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerHandle {
    /// Hand a task to the scheduler. Safe to call from any thread.
    ///
    /// Returns `false` if the scheduler is shutting down; the task is dropped.
    pub fn post(&self, task: Task) -> bool {
        self.tx.send(task).is_ok()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.tx.is_closed()
    }
}
