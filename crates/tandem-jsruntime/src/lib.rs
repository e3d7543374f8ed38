//! V8 bridge for tandem
//!
//! Embeds a V8 engine (through deno_core) in a reference-counted Rust host.
//! Three pieces make the two runtimes cooperate:
//! - the liveness registry, which keeps engine objects alive exactly as long
//!   as some host wrapper needs them
//! - the value marshaler, which converts values in both directions
//! - the job queue bridge, which lets the host event loop drain engine jobs
//!
//! All engine state is thread-local. Each script thread calls
//! `js_runtime_init` once and `js_runtime_shutdown` when done; other threads
//! interact only through a `SchedulerHandle` or a `Deferred`.

mod bridge;
mod config;
mod dispatch;
mod interop;
mod job_queue;
mod objects;
mod ops;
mod registry;

pub use bridge::{classify, to_engine, to_host, EngineKind, MAX_SAFE_INTEGER};
pub use config::{ConfigError, RuntimeConfig};
pub use dispatch::{dispatch_to_event_loop, js_new_deferred, Deferred};
pub use interop::{
    js_as_ucs4, js_collect, js_enqueue_job, js_eval, js_job_queue_is_empty, js_new,
    js_run_jobs, js_typeof,
};
pub use job_queue::{
    job_queue_state, DrainReport, JobLevel, JobQueue, JobQueueInterruption, QueueError,
    QueueState, SavedJobQueue,
};
pub use objects::{host_function_count, JsObjectRef};
pub use registry::{
    registry_stats, sweep, HandleId, LivenessRegistry, RegistryStats, SweepOutcome, Swept,
};
// Re-export the engine bindings used in `to_host`/`to_engine` signatures
pub use deno_core::v8;

use deno_core::{JsRuntime, RuntimeOptions};
use std::cell::RefCell;
use tandem_runtime::{HostError, HostResult, SchedulerHandle};

thread_local! {
    /// Thread-local V8 runtime instance
    /// JsRuntime is not Send, so it must be thread-local
    static JS_RUNTIME: RefCell<Option<JsRuntimeState>> = const { RefCell::new(None) };

    /// Kept apart from `JS_RUNTIME`, which stays borrowed while script runs
    static BRIDGE_CONTEXT: RefCell<Option<BridgeContext>> = const { RefCell::new(None) };

    /// Scopes of the engine frames currently executing host code, innermost last
    static ACTIVE_SCOPES: RefCell<Vec<*mut v8::HandleScope<'static>>> = const { RefCell::new(Vec::new()) };
}

/// State for the JS runtime
pub struct JsRuntimeState {
    pub runtime: JsRuntime,
}

struct BridgeContext {
    config: RuntimeConfig,
    scheduler: Option<SchedulerHandle>,
    global: v8::Global<v8::Object>,
}

/// Initialize the runtime for the current thread.
///
/// A second call on the same thread is a no-op and keeps the first
/// configuration. `scheduler` receives drain requests and deferred
/// settlements; without one the host drains with `js_run_jobs`.
pub fn js_runtime_init(config: RuntimeConfig, scheduler: Option<SchedulerHandle>) -> HostResult<()> {
    let initialized = JS_RUNTIME.with(|cell| cell.try_borrow().map_or(true, |opt| opt.is_some()));
    if initialized {
        log::debug!("Runtime already initialized on this thread");
        return Ok(());
    }
    config
        .validate()
        .map_err(|err| HostError::Engine(format!("invalid runtime config: {}", err)))?;

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![ops::tandem_ops::init_ops()],
        create_params: config.create_params(),
        ..Default::default()
    });

    {
        let isolate = runtime.v8_isolate();
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::kExplicit);
        isolate.add_gc_prologue_callback(
            registry::gc_prologue,
            std::ptr::null_mut(),
            v8::GCType::kGCTypeAll,
        );
        isolate.set_promise_hook(job_queue::promise_hook);
    }

    let global = {
        let scope = &mut runtime.handle_scope();
        job_queue::install_queue_microtask(scope)?;
        let context = scope.get_current_context();
        let global = context.global(scope);
        v8::Global::new(scope, global)
    };

    log::debug!(
        "Runtime initialized (max heap: {:?}, scheduler: {})",
        config.max_heap_size,
        scheduler.is_some()
    );
    BRIDGE_CONTEXT.with(|cell| {
        *cell.borrow_mut() = Some(BridgeContext {
            config,
            scheduler,
            global,
        })
    });
    JS_RUNTIME.with(|cell| *cell.borrow_mut() = Some(JsRuntimeState { runtime }));
    Ok(())
}

/// Tear down this thread's runtime. Pending jobs and unsettled deferreds are
/// dropped, then every rooted handle is released before the isolate goes.
pub fn js_runtime_shutdown() {
    job_queue::clear();
    dispatch::clear();
    objects::clear_host_functions();
    registry::clear();
    BRIDGE_CONTEXT.with(|cell| cell.borrow_mut().take());
    let state = JS_RUNTIME.with(|cell| cell.borrow_mut().take());
    if state.is_some() {
        log::debug!("Runtime shut down");
    }
    drop(state);
}

/// Initialize the JS runtime for the current thread with default settings
pub fn ensure_runtime_initialized() -> HostResult<()> {
    js_runtime_init(RuntimeConfig::default(), None)
}

/// Execute a closure with the JS runtime
///
/// Fails while script is running on this thread; use `with_scope` from
/// host code that may be called back by the engine.
pub fn with_runtime<F, R>(f: F) -> HostResult<R>
where
    F: FnOnce(&mut JsRuntimeState) -> R,
{
    ensure_runtime_initialized()?;
    JS_RUNTIME.with(|cell| {
        let mut opt = cell
            .try_borrow_mut()
            .map_err(|_| HostError::Engine("runtime is busy".to_string()))?;
        let state = opt
            .as_mut()
            .ok_or_else(|| HostError::Engine("runtime is not initialized".to_string()))?;
        Ok(f(state))
    })
}

/// Run `f` in a handle scope with the main context entered.
///
/// Called from host code that the engine invoked, the new scope nests inside
/// the engine's active frame instead of re-borrowing the runtime.
pub fn with_scope<F, R>(f: F) -> HostResult<R>
where
    F: for<'s> FnOnce(&mut v8::HandleScope<'s>) -> R,
{
    let parent = ACTIVE_SCOPES.with(|scopes| scopes.borrow().last().copied());
    if let Some(parent) = parent {
        // SAFETY: `enter_scope` only publishes scopes that outlive its
        // callback and pops them, innermost first, before returning. The
        // frame that owns `parent` is suspended in host code on this thread,
        // so this is the only live use of the scope until `f` returns, and
        // the child scope below is dropped before the guard pops `parent`.
        let parent = unsafe { &mut *parent };
        let scope = &mut v8::HandleScope::new(parent);
        return Ok(enter_scope(scope, f));
    }
    with_runtime(|state| {
        let scope = &mut state.runtime.handle_scope();
        enter_scope(scope, f)
    })
}

/// Publish `scope` as the innermost active scope while `f` runs.
pub(crate) fn enter_scope<'s, F, R>(scope: &mut v8::HandleScope<'s>, f: F) -> R
where
    F: FnOnce(&mut v8::HandleScope<'s>) -> R,
{
    let ptr = scope as *mut v8::HandleScope<'s> as *mut v8::HandleScope<'static>;
    ACTIVE_SCOPES.with(|scopes| scopes.borrow_mut().push(ptr));
    let _guard = ActiveScopeGuard(ptr);
    f(scope)
}

/// Pops the scope it published. Scopes must leave in the order they entered.
struct ActiveScopeGuard(*mut v8::HandleScope<'static>);

impl Drop for ActiveScopeGuard {
    fn drop(&mut self) {
        let popped = ACTIVE_SCOPES
            .try_with(|scopes| scopes.borrow_mut().pop())
            .ok()
            .flatten();
        assert!(
            popped.map_or(true, |ptr| ptr == self.0),
            "active scope stack unbalanced"
        );
    }
}

#[cfg(test)]
fn active_scope_depth() -> usize {
    ACTIVE_SCOPES.with(|scopes| scopes.borrow().len())
}

pub(crate) fn max_marshal_depth() -> usize {
    BRIDGE_CONTEXT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map_or(RuntimeConfig::default().max_marshal_depth, |ctx| {
                ctx.config.max_marshal_depth
            })
    })
}

/// Also called from engine hooks, so it never panics on a busy or torn down
/// context.
pub(crate) fn scheduler_handle() -> Option<SchedulerHandle> {
    BRIDGE_CONTEXT
        .try_with(|cell| {
            cell.try_borrow()
                .ok()
                .and_then(|ctx| ctx.as_ref().and_then(|ctx| ctx.scheduler.clone()))
        })
        .ok()
        .flatten()
}

pub(crate) fn incumbent_global_handle() -> Option<v8::Global<v8::Object>> {
    BRIDGE_CONTEXT.with(|cell| cell.borrow().as_ref().map(|ctx| ctx.global.clone()))
}
