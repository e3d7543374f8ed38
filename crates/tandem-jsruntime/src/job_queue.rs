//! Job queue bridge
//!
//! Pending jobs are serviced by the host's event loop instead of a loop
//! inside the engine. Two kinds of job reach the queue:
//! - bridge jobs, from `queueMicrotask` and `js_enqueue_job`
//! - promise reactions, which V8 queues itself
//!
//! Both land in V8's microtask queue, so a drain runs them in one FIFO
//! checkpoint: everything queued before a job runs ahead of anything that job
//! queues, whatever its kind. A promise hook notices new reactions, marks the
//! queue pending and posts a drain request to the host scheduler, exactly as a
//! bridge enqueue does. Pending reactions cannot be counted, so `is_empty` is
//! conservative for them: it reports work from the moment a reaction may have
//! been queued until the next drain.
//!
//! `save`/`restore` support nested drains (a debugger-style interruption must
//! not interleave its jobs with the interrupted script's). While saved, bridge
//! jobs go to a queue of their own and the interrupted queue, reactions
//! included, is not drained. Saves nest and must be restored in reverse order;
//! a violation is fatal.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use deno_core::v8;
use tandem_runtime::{HostError, HostResult};
use thiserror::Error;

use crate::bridge::{capture_exception, engine_string};
use crate::objects::throw_error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("out of memory while enqueuing a job")]
    OutOfMemory,
    #[error("job queue restored while jobs are still pending")]
    RestoreNotEmpty,
    #[error("job queue restored out of order: expected save depth {expected}, got {found}")]
    RestoreOutOfOrder { expected: usize, found: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing pending, not draining
    Idle,
    /// Jobs pending, not draining
    Enqueuing,
    Draining,
    /// A save is outstanding and the live queue is a nested one
    Saved,
}

/// One nesting level of a `JobQueue`: the jobs a single drain services.
pub trait JobLevel {
    fn is_empty(&self) -> bool;
}

impl<J> JobLevel for VecDeque<J> {
    fn is_empty(&self) -> bool {
        VecDeque::is_empty(self)
    }
}

pub struct JobQueue<L> {
    level: L,
    draining: bool,
    /// Number of outstanding saves
    depth: usize,
}

/// A level displaced by `JobQueue::save`.
pub struct SavedJobQueue<L> {
    level: L,
    draining: bool,
    depth: usize,
}

impl<L: JobLevel> SavedJobQueue<L> {
    pub fn level(&self) -> &L {
        &self.level
    }

    pub fn is_empty(&self) -> bool {
        self.level.is_empty()
    }

    /// Nesting level this save was taken at, starting from 1.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl<L: JobLevel> JobQueue<L> {
    pub fn new(level: L) -> Self {
        Self {
            level,
            draining: false,
            depth: 0,
        }
    }

    /// The live level.
    pub fn level(&self) -> &L {
        &self.level
    }

    pub fn level_mut(&mut self) -> &mut L {
        &mut self.level
    }

    pub fn is_empty(&self) -> bool {
        self.level.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn state(&self) -> QueueState {
        if self.draining {
            QueueState::Draining
        } else if self.depth > 0 {
            QueueState::Saved
        } else if !self.level.is_empty() {
            QueueState::Enqueuing
        } else {
            QueueState::Idle
        }
    }

    /// Mark the live level as draining. Returns `false` if it already is.
    pub fn begin_drain(&mut self) -> bool {
        !std::mem::replace(&mut self.draining, true)
    }

    pub fn end_drain(&mut self) {
        self.draining = false;
    }

    /// Put `fresh` in place of the live level. The displaced level keeps its
    /// jobs and draining flag until the snapshot is restored.
    pub fn save(&mut self, fresh: L) -> SavedJobQueue<L> {
        self.depth += 1;
        SavedJobQueue {
            level: std::mem::replace(&mut self.level, fresh),
            draining: std::mem::replace(&mut self.draining, false),
            depth: self.depth,
        }
    }

    /// Check that `saved` may be restored now.
    pub fn validate_restore(&self, saved: &SavedJobQueue<L>) -> Result<(), QueueError> {
        if !self.level.is_empty() {
            return Err(QueueError::RestoreNotEmpty);
        }
        if saved.depth != self.depth {
            return Err(QueueError::RestoreOutOfOrder {
                expected: self.depth,
                found: saved.depth,
            });
        }
        Ok(())
    }

    /// Reinstate a saved level and hand back the nested one it replaces.
    ///
    /// # Panics
    /// If the live level is not empty or `saved` is not the innermost
    /// outstanding save.
    pub fn restore(&mut self, saved: SavedJobQueue<L>) -> L {
        if let Err(err) = self.validate_restore(&saved) {
            panic!("job queue nesting violated: {}", err);
        }
        self.draining = saved.draining;
        self.depth -= 1;
        std::mem::replace(&mut self.level, saved.level)
    }
}

impl<J> JobQueue<VecDeque<J>> {
    /// Append a job. Out of memory is reported distinctly so the engine can
    /// raise its own OOM error.
    pub fn enqueue(&mut self, job: J) -> Result<(), QueueError> {
        self.level
            .try_reserve(1)
            .map_err(|_| QueueError::OutOfMemory)?;
        self.level.push_back(job);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<J> {
        self.level.pop_front()
    }

    pub fn len(&self) -> usize {
        self.level.len()
    }

    /// Run jobs oldest first until the queue is empty, including jobs
    /// enqueued by the jobs themselves. The queue is not borrowed while a job
    /// runs. A call made while already draining returns 0 without running
    /// anything.
    pub fn run_all<F>(queue: &RefCell<Self>, mut run: F) -> usize
    where
        F: FnMut(J),
    {
        if !queue.borrow_mut().begin_drain() {
            return 0;
        }
        let mut ran = 0;
        loop {
            let next = queue.borrow_mut().pop();
            let Some(job) = next else {
                break;
            };
            run(job);
            ran += 1;
        }
        queue.borrow_mut().end_drain();
        ran
    }
}

impl<L: JobLevel + Default> Default for JobQueue<L> {
    fn default() -> Self {
        Self::new(L::default())
    }
}

// ---------------------------------------------------------------------------
// Engine instance
// ---------------------------------------------------------------------------

/// A level of the engine queue.
///
/// The outermost level is V8's own microtask queue, where promise reactions
/// are queued too. Levels opened by an interruption are detached queues that
/// only bridge jobs reach.
#[derive(Default)]
pub struct EngineLevel {
    queue: Option<Rc<v8::UniqueRef<v8::MicrotaskQueue>>>,
    /// A bridge job was queued since the last drain of this level
    pending: bool,
}

impl JobLevel for EngineLevel {
    fn is_empty(&self) -> bool {
        let reactions = self.queue.is_none() && REACTIONS_PENDING.with(Cell::get);
        !self.pending && !reactions
    }
}

/// Result of one drain.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Bridge jobs plus the promise reactions V8 reported running
    pub jobs_run: usize,
    /// Exceptions thrown by bridge jobs; draining continues past them
    pub errors: Vec<HostError>,
}

thread_local! {
    static JOB_QUEUE: RefCell<JobQueue<EngineLevel>> = RefCell::new(JobQueue::default());
    /// A promise reaction may be waiting in V8's queue
    static REACTIONS_PENDING: Cell<bool> = const { Cell::new(false) };
    static DRAIN_REQUESTED: Cell<bool> = const { Cell::new(false) };
    static JOBS_RUN: Cell<usize> = const { Cell::new(0) };
    static DRAIN_ERRORS: RefCell<Vec<HostError>> = const { RefCell::new(Vec::new()) };
    /// Bumped by `clear`; levels saved under an older generation belong to a
    /// runtime that no longer exists
    static GENERATION: Cell<u64> = const { Cell::new(0) };
}

/// The global the embedding considers to be calling right now. There is only
/// one managed global, so it is always the one recorded at init.
pub fn incumbent_global<'s>(scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Object> {
    match crate::incumbent_global_handle() {
        Some(global) => v8::Local::new(scope, &global),
        None => {
            let context = scope.get_current_context();
            context.global(scope)
        }
    }
}

/// Queue `callback` on the live level and ask the host scheduler for a drain.
///
/// Returns `Ok(false)` if the scheduler is shutting down; the job is dropped.
pub fn enqueue_job(
    scope: &mut v8::HandleScope,
    callback: v8::Local<v8::Function>,
    promise: Option<v8::Local<v8::Promise>>,
) -> Result<bool, QueueError> {
    if crate::scheduler_handle().is_some_and(|scheduler| scheduler.is_shutting_down()) {
        log::warn!("Scheduler is shutting down, discarding job");
        return Ok(false);
    }

    let incumbent = incumbent_global(scope);
    let promise: v8::Local<v8::Value> = match promise {
        Some(promise) => promise.into(),
        None => v8::undefined(scope).into(),
    };
    // The array keeps the callback and its promise rooted while queued
    let data = v8::Array::new_with_elements(scope, &[callback.into(), incumbent.into(), promise]);
    let job = v8::Function::builder(run_bridge_job)
        .data(data.into())
        .build(scope)
        .ok_or(QueueError::OutOfMemory)?;

    let nested = JOB_QUEUE.with(|cell| {
        let mut queue = cell.borrow_mut();
        let level = queue.level_mut();
        level.pending = true;
        level.queue.clone()
    });
    match nested {
        Some(queue) => queue.enqueue_microtask(scope, job),
        None => scope.enqueue_microtask(job),
    }
    request_drain();
    Ok(true)
}

fn run_bridge_job<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    _retval: v8::ReturnValue,
) {
    JOBS_RUN.with(|ran| ran.set(ran.get() + 1));
    let Ok(job) = v8::Local::<v8::Array>::try_from(args.data()) else {
        return;
    };
    let callback = job
        .get_index(scope, 0)
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok());
    let global = job
        .get_index(scope, 1)
        .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok());
    let (Some(callback), Some(global)) = (callback, global) else {
        log::error!("Malformed bridge job");
        return;
    };

    let context = global
        .get_creation_context(scope)
        .unwrap_or_else(|| scope.get_current_context());
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let recv = v8::undefined(tc).into();
    if callback.call(tc, recv, &[]).is_none() {
        let err = capture_exception(tc);
        log::error!("Job threw: {}", err);
        DRAIN_ERRORS.with(|errors| errors.borrow_mut().push(err));
    }
}

/// Post one drain request unless one is already outstanding. Without a
/// scheduler the host drains explicitly.
fn request_drain() {
    if DRAIN_REQUESTED.try_with(Cell::get).unwrap_or(true) {
        return;
    }
    let Some(scheduler) = crate::scheduler_handle() else {
        return;
    };
    if scheduler.post(Box::new(drain_on_main_loop)) {
        DRAIN_REQUESTED.with(|requested| requested.set(true));
    } else {
        log::debug!("Scheduler is shutting down, no drain requested");
    }
}

fn drain_on_main_loop() {
    match crate::interop::js_run_jobs() {
        Ok(report) => {
            if report.jobs_run > 0 {
                log::debug!("Main loop drained {} job(s)", report.jobs_run);
            }
        }
        Err(err) => log::error!("Main loop drain failed: {}", err),
    }
}

/// Registered on the isolate. Marks the outermost level pending whenever a
/// promise reaction may have been queued.
pub(crate) extern "C" fn promise_hook(
    hook: v8::PromiseHookType,
    _promise: v8::Local<v8::Promise>,
    parent: v8::Local<v8::Value>,
) {
    let queued = match hook {
        // `then` on a settled promise queues its reaction right away
        v8::PromiseHookType::Init => !parent.is_undefined(),
        v8::PromiseHookType::Resolve => true,
        v8::PromiseHookType::Before => {
            let _ = JOBS_RUN.try_with(|ran| ran.set(ran.get() + 1));
            false
        }
        v8::PromiseHookType::After => false,
    };
    if !queued {
        return;
    }
    let newly = REACTIONS_PENDING
        .try_with(|pending| !pending.replace(true))
        .unwrap_or(false);
    if newly {
        request_drain();
    }
}

/// Drain the live level at a checkpoint. Re-entrant calls return an empty
/// report.
pub fn run_jobs(scope: &mut v8::HandleScope) -> DrainReport {
    DRAIN_REQUESTED.with(|requested| requested.set(false));
    let target = JOB_QUEUE.with(|cell| {
        let mut queue = cell.borrow_mut();
        if !queue.begin_drain() {
            return None;
        }
        Some(queue.level().queue.clone())
    });
    let Some(nested) = target else {
        return DrainReport::default();
    };

    let ran_before = JOBS_RUN.with(Cell::get);
    let errors_before = DRAIN_ERRORS.with(|errors| errors.borrow().len());
    // A checkpoint runs until its queue is empty, jobs queued meanwhile included
    match &nested {
        Some(queue) => queue.perform_checkpoint(scope),
        None => {
            REACTIONS_PENDING.with(|pending| pending.set(false));
            scope.perform_microtask_checkpoint();
            REACTIONS_PENDING.with(|pending| pending.set(false));
        }
    }
    JOB_QUEUE.with(|cell| {
        let mut queue = cell.borrow_mut();
        queue.level_mut().pending = false;
        queue.end_drain();
    });

    DrainReport {
        jobs_run: JOBS_RUN.with(Cell::get) - ran_before,
        errors: DRAIN_ERRORS.with(|errors| errors.borrow_mut().split_off(errors_before)),
    }
}

pub fn is_empty() -> bool {
    JOB_QUEUE.with(|queue| queue.borrow().is_empty())
}

pub fn job_queue_state() -> QueueState {
    JOB_QUEUE.with(|queue| queue.borrow().state())
}

pub(crate) fn clear() {
    GENERATION.with(|generation| generation.set(generation.get() + 1));
    let queue = JOB_QUEUE.with(|cell| std::mem::take(&mut *cell.borrow_mut()));
    if !queue.is_empty() {
        log::debug!("Dropped pending jobs at depth {}", queue.depth());
    }
    REACTIONS_PENDING.with(|pending| pending.set(false));
    DRAIN_REQUESTED.with(|requested| requested.set(false));
    DRAIN_ERRORS.with(|errors| errors.borrow_mut().clear());
    drop(queue);
}

/// Saves the job queue for the lifetime of the guard.
///
/// Jobs enqueued while the guard is alive form their own queue; dropping the
/// guard requires that queue to be empty and puts the saved level back.
/// Promise reactions are always queued with the outermost level, so those
/// triggered during the interruption wait for it to end.
pub struct JobQueueInterruption {
    saved: Option<SavedJobQueue<EngineLevel>>,
    generation: u64,
}

impl JobQueueInterruption {
    pub fn new() -> HostResult<Self> {
        let fresh = crate::with_scope(|scope| {
            v8::MicrotaskQueue::new(scope, v8::MicrotasksPolicy::kExplicit)
        })?;
        let saved = JOB_QUEUE.with(|queue| {
            queue.borrow_mut().save(EngineLevel {
                queue: Some(Rc::new(fresh)),
                pending: false,
            })
        });
        log::debug!(
            "Job queue saved at depth {} (jobs held back: {})",
            saved.depth(),
            !saved.is_empty()
        );
        Ok(Self {
            saved: Some(saved),
            generation: GENERATION.with(Cell::get),
        })
    }

    /// Whether the interrupted level has jobs waiting for this guard to go.
    pub fn holds_jobs(&self) -> bool {
        self.saved.as_ref().is_some_and(|saved| !saved.is_empty())
    }
}

impl Drop for JobQueueInterruption {
    fn drop(&mut self) {
        let Some(saved) = self.saved.take() else {
            return;
        };
        if GENERATION.try_with(Cell::get).ok() != Some(self.generation) {
            // The isolate that owns these queues is gone
            std::mem::forget(saved);
            return;
        }
        let (nested, resumed) = JOB_QUEUE.with(|cell| {
            let mut queue = cell.borrow_mut();
            let nested = queue.restore(saved);
            (nested, !queue.is_empty())
        });
        drop(nested);
        if resumed {
            request_drain();
        }
    }
}

/// Install `queueMicrotask` on the global object.
pub(crate) fn install_queue_microtask(scope: &mut v8::HandleScope) -> HostResult<()> {
    let func = v8::Function::new(scope, queue_microtask_callback)
        .ok_or_else(|| HostError::Engine("failed to create queueMicrotask".to_string()))?;
    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = engine_string(scope, "queueMicrotask")?;
    global
        .set(scope, key.into(), func.into())
        .ok_or_else(|| HostError::Engine("failed to install queueMicrotask".to_string()))?;
    Ok(())
}

fn queue_microtask_callback<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    _retval: v8::ReturnValue,
) {
    let Ok(callback) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
        let message = v8::String::new(scope, "queueMicrotask requires a function")
            .unwrap_or_else(|| v8::String::empty(scope));
        let exception = v8::Exception::type_error(scope, message);
        scope.throw_exception(exception);
        return;
    };
    match enqueue_job(scope, callback, None) {
        Ok(true) => {}
        Ok(false) => log::debug!("queueMicrotask job discarded during shutdown"),
        Err(QueueError::OutOfMemory) => {
            let message = v8::String::new(scope, "out of memory while queueing a microtask")
                .unwrap_or_else(|| v8::String::empty(scope));
            let exception = v8::Exception::range_error(scope, message);
            scope.throw_exception(exception);
        }
        Err(err) => throw_error(scope, &err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::{js_eval, js_run_jobs};
    use crate::{js_runtime_init, js_runtime_shutdown, RuntimeConfig};
    use tandem_runtime::Scheduler;

    fn setup() {
        let _ = env_logger::builder().is_test(true).try_init();
        js_runtime_init(RuntimeConfig::default(), None).unwrap();
    }

    fn log_contents() -> String {
        let log = js_eval("globalThis.log.join(',')").unwrap();
        log.as_str().unwrap().to_string_lossy()
    }

    #[test]
    fn test_run_all_is_breadth_first() {
        let queue = RefCell::new(JobQueue::<VecDeque<&str>>::default());
        queue.borrow_mut().enqueue("a").unwrap();
        queue.borrow_mut().enqueue("b").unwrap();
        assert_eq!(queue.borrow().state(), QueueState::Enqueuing);

        let mut order = Vec::new();
        let ran = JobQueue::run_all(&queue, |job| {
            order.push(job);
            assert_eq!(queue.borrow().state(), QueueState::Draining);
            // Re-entrant drain is a no-op
            assert_eq!(JobQueue::run_all(&queue, |_| unreachable!()), 0);
            match job {
                "a" => queue.borrow_mut().enqueue("a1").unwrap(),
                "b" => queue.borrow_mut().enqueue("b1").unwrap(),
                "a1" => queue.borrow_mut().enqueue("a2").unwrap(),
                _ => {}
            }
        });
        assert_eq!(ran, 5);
        assert_eq!(order, vec!["a", "b", "a1", "b1", "a2"]);
        assert_eq!(queue.borrow().state(), QueueState::Idle);
    }

    #[test]
    fn test_save_then_restore_is_identity() {
        let mut queue = JobQueue::<VecDeque<u32>>::default();
        for job in [3, 1, 2] {
            queue.enqueue(job).unwrap();
        }
        let saved = queue.save(VecDeque::new());
        assert!(queue.is_empty());
        assert_eq!(queue.state(), QueueState::Saved);
        assert_eq!(saved.level().len(), 3);

        let nested = queue.restore(saved);
        assert!(nested.is_empty());
        assert_eq!(queue.state(), QueueState::Enqueuing);
        let drained: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![3, 1, 2]);
    }

    #[test]
    fn test_nested_saves_restore_in_reverse() {
        let mut queue = JobQueue::<VecDeque<&str>>::default();
        queue.enqueue("outer").unwrap();
        let outer = queue.save(VecDeque::new());
        queue.enqueue("inner").unwrap();
        let inner = queue.save(VecDeque::new());

        assert_eq!(
            queue.validate_restore(&outer),
            Err(QueueError::RestoreOutOfOrder {
                expected: 2,
                found: 1
            })
        );
        queue.restore(inner);
        assert_eq!(queue.validate_restore(&outer), Err(QueueError::RestoreNotEmpty));
        assert_eq!(queue.pop(), Some("inner"));
        queue.restore(outer);
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.pop(), Some("outer"));
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_out_of_order_restore_panics() {
        let mut queue = JobQueue::<VecDeque<u8>>::default();
        let outer = queue.save(VecDeque::new());
        let _inner = queue.save(VecDeque::new());
        queue.restore(outer);
    }

    #[test]
    fn test_save_during_drain_isolates_jobs() {
        let queue = RefCell::new(JobQueue::<VecDeque<&str>>::default());
        queue.borrow_mut().enqueue("first").unwrap();
        queue.borrow_mut().enqueue("second").unwrap();
        let mut order = Vec::new();
        JobQueue::run_all(&queue, |job| {
            order.push(job);
            if job == "first" {
                let saved = queue.borrow_mut().save(VecDeque::new());
                queue.borrow_mut().enqueue("nested").unwrap();
                JobQueue::run_all(&queue, |nested| order.push(nested));
                queue.borrow_mut().restore(saved);
                assert!(queue.borrow().is_draining());
            }
        });
        assert_eq!(order, vec!["first", "nested", "second"]);
    }

    #[test]
    fn test_queue_microtask_order() {
        setup();
        js_eval(
            "globalThis.log = [];
             queueMicrotask(() => { log.push('a'); queueMicrotask(() => log.push('a1')); });
             queueMicrotask(() => { log.push('b'); queueMicrotask(() => log.push('b1')); });",
        )
        .unwrap();
        assert!(!is_empty());
        let report = js_run_jobs().unwrap();
        assert_eq!(report.jobs_run, 4);
        assert!(report.errors.is_empty());
        assert_eq!(log_contents(), "a,b,a1,b1");
        assert!(is_empty());
        js_runtime_shutdown();
    }

    #[test]
    fn test_promise_reactions_run_breadth_first() {
        setup();
        js_eval(
            "globalThis.log = [];
             queueMicrotask(() => { log.push('j1'); Promise.resolve().then(() => log.push('p1')); });
             queueMicrotask(() => log.push('j2'));",
        )
        .unwrap();
        js_run_jobs().unwrap();
        assert_eq!(log_contents(), "j1,j2,p1");
        js_runtime_shutdown();
    }

    #[test]
    fn test_pending_reaction_is_not_empty() {
        setup();
        assert!(is_empty());
        js_eval("globalThis.log = []; void Promise.resolve().then(() => log.push('reaction'));")
            .unwrap();
        assert!(!is_empty());
        assert_eq!(job_queue_state(), QueueState::Enqueuing);
        assert_eq!(log_contents(), "");

        js_run_jobs().unwrap();
        assert_eq!(log_contents(), "reaction");
        assert!(is_empty());
        js_runtime_shutdown();
    }

    #[test]
    fn test_job_errors_do_not_stop_drain() {
        setup();
        js_eval(
            "globalThis.log = [];
             queueMicrotask(() => { throw new Error('boom'); });
             queueMicrotask(() => log.push('after'));",
        )
        .unwrap();
        let report = js_run_jobs().unwrap();
        assert_eq!(report.jobs_run, 2);
        assert_eq!(report.errors, vec![HostError::script("Error", "boom")]);
        assert_eq!(log_contents(), "after");
        js_runtime_shutdown();
    }

    #[test]
    fn test_queue_microtask_rejects_non_functions() {
        setup();
        let err = js_eval("queueMicrotask(42)").unwrap_err();
        assert_eq!(err, HostError::script("TypeError", "queueMicrotask requires a function"));
        js_runtime_shutdown();
    }

    #[test]
    fn test_interruption_keeps_queues_apart() {
        setup();
        js_eval("globalThis.log = []; queueMicrotask(() => log.push('debuggee'));").unwrap();
        {
            let interruption = JobQueueInterruption::new().unwrap();
            assert!(interruption.holds_jobs());
            assert!(is_empty());
            assert_eq!(job_queue_state(), QueueState::Saved);
            js_eval("queueMicrotask(() => log.push('debugger'))").unwrap();
            assert!(!is_empty());
            js_run_jobs().unwrap();
            assert_eq!(log_contents(), "debugger");
            assert!(is_empty());
        }
        assert!(!is_empty());
        js_run_jobs().unwrap();
        assert_eq!(log_contents(), "debugger,debuggee");
        js_runtime_shutdown();
    }

    #[test]
    fn test_interruption_holds_back_promise_reactions() {
        setup();
        js_eval("globalThis.log = []; void Promise.resolve().then(() => log.push('debuggee'));")
            .unwrap();
        {
            let interruption = JobQueueInterruption::new().unwrap();
            assert!(interruption.holds_jobs());
            assert!(is_empty());
            js_eval("queueMicrotask(() => log.push('debugger'))").unwrap();
            js_run_jobs().unwrap();
            assert_eq!(log_contents(), "debugger");
        }
        assert!(!is_empty());
        js_run_jobs().unwrap();
        assert_eq!(log_contents(), "debugger,debuggee");
        js_runtime_shutdown();
    }

    #[test]
    fn test_nested_interruptions() {
        setup();
        js_eval("globalThis.log = []; queueMicrotask(() => log.push('outer'));").unwrap();
        let first = JobQueueInterruption::new().unwrap();
        js_eval("queueMicrotask(() => log.push('middle'))").unwrap();
        let second = JobQueueInterruption::new().unwrap();
        assert!(second.holds_jobs());
        js_eval("queueMicrotask(() => log.push('inner'))").unwrap();
        js_run_jobs().unwrap();
        drop(second);
        js_run_jobs().unwrap();
        drop(first);
        js_run_jobs().unwrap();
        assert_eq!(log_contents(), "inner,middle,outer");
        assert_eq!(job_queue_state(), QueueState::Idle);
        js_runtime_shutdown();
    }

    #[test]
    fn test_scheduler_drives_drain() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut scheduler = Scheduler::new();
        js_runtime_init(RuntimeConfig::default(), Some(scheduler.handle())).unwrap();
        js_eval("globalThis.log = []; queueMicrotask(() => log.push('posted'));").unwrap();
        assert!(scheduler.run_until_idle() >= 1);
        assert!(is_empty());
        assert_eq!(log_contents(), "posted");

        scheduler.shutdown();
        js_eval("queueMicrotask(() => log.push('late'))").unwrap();
        assert!(is_empty());
        js_run_jobs().unwrap();
        assert_eq!(log_contents(), "posted");
        js_runtime_shutdown();
    }

    #[test]
    fn test_scheduler_drains_promise_reactions() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut scheduler = Scheduler::new();
        js_runtime_init(RuntimeConfig::default(), Some(scheduler.handle())).unwrap();
        js_eval("globalThis.log = []; void Promise.resolve().then(() => log.push('reaction'));")
            .unwrap();
        assert!(scheduler.run_until_idle() >= 1);
        assert_eq!(log_contents(), "reaction");
        assert!(is_empty());
        js_runtime_shutdown();
    }
}
