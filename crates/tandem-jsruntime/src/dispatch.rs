//! Off-thread dispatch
//!
//! Worker threads never touch the engine. They hold a `SchedulerHandle` (or a
//! `Deferred`, which wraps one) and post closures; the script thread runs them
//! when the host drives its scheduler.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use deno_core::v8;
use tandem_runtime::{HostError, HostResult, HostValue, SchedulerHandle, SendValue, Task};

use crate::bridge::{engine_string, to_engine, to_host};

thread_local! {
    static DEFERREDS: RefCell<HashMap<u64, v8::Global<v8::PromiseResolver>>> =
        RefCell::new(HashMap::new());
    static NEXT_DEFERRED_ID: Cell<u64> = const { Cell::new(1) };
}

/// Post `task` to this thread's scheduler.
///
/// Returns `false` when no scheduler is configured or it is shutting down;
/// the task is dropped.
pub fn dispatch_to_event_loop(task: Task) -> bool {
    let Some(scheduler) = crate::scheduler_handle() else {
        log::debug!("No scheduler configured, dropping dispatched task");
        return false;
    };
    let posted = scheduler.post(task);
    if !posted {
        log::debug!("Scheduler is shutting down, dropping dispatched task");
    }
    posted
}

enum Settlement {
    Resolve(SendValue),
    Reject(String),
}

/// Settles a promise created by `js_new_deferred` from any thread.
///
/// A `Deferred` that is dropped unsettled leaves its promise pending until
/// the runtime shuts down.
pub struct Deferred {
    id: u64,
    scheduler: SchedulerHandle,
}

impl Deferred {
    pub fn resolve(self, value: SendValue) -> bool {
        self.settle(Settlement::Resolve(value))
    }

    /// Reject with an `Error` carrying `message`.
    pub fn reject(self, message: impl Into<String>) -> bool {
        self.settle(Settlement::Reject(message.into()))
    }

    fn settle(self, settlement: Settlement) -> bool {
        let id = self.id;
        let posted = self
            .scheduler
            .post(Box::new(move || settle_on_main_loop(id, settlement)));
        if !posted {
            log::debug!("Deferred {} settlement discarded: scheduler is shutting down", id);
        }
        posted
    }
}

/// Create a pending promise together with the `Deferred` that settles it.
///
/// Needs a scheduler, since settlements travel through it.
pub fn js_new_deferred() -> HostResult<(HostValue, Deferred)> {
    let scheduler = crate::scheduler_handle().ok_or_else(|| {
        HostError::Engine("deferred promises need a scheduler".to_string())
    })?;
    let id = NEXT_DEFERRED_ID.with(|next| {
        let current = next.get();
        next.set(current + 1);
        current
    });

    let promise = crate::with_scope(|scope| {
        let resolver = v8::PromiseResolver::new(scope)
            .ok_or_else(|| HostError::Engine("failed to create a promise".to_string()))?;
        let promise = resolver.get_promise(scope);
        let resolver = v8::Global::new(scope, resolver);
        DEFERREDS.with(|deferreds| deferreds.borrow_mut().insert(id, resolver));
        to_host(scope, promise.into())
    })??;

    Ok((promise, Deferred { id, scheduler }))
}

fn settle_on_main_loop(id: u64, settlement: Settlement) {
    let Some(resolver) = DEFERREDS.with(|deferreds| deferreds.borrow_mut().remove(&id)) else {
        log::debug!("Deferred {} no longer exists", id);
        return;
    };

    let settled = crate::with_scope(|scope| {
        let resolver = v8::Local::new(scope, &resolver);
        let done = match settlement {
            Settlement::Resolve(value) => {
                let value = to_engine(scope, &value.into_host())?;
                resolver.resolve(scope, value)
            }
            Settlement::Reject(message) => {
                let message = engine_string(scope, &message)?;
                let error = v8::Exception::error(scope, message);
                resolver.reject(scope, error)
            }
        };
        done.map(|_| ())
            .ok_or_else(|| HostError::Engine(format!("failed to settle deferred {}", id)))
    })
    .and_then(|settled| settled);

    if let Err(err) = settled {
        log::error!("{}", err);
        return;
    }
    if let Err(err) = crate::interop::js_run_jobs() {
        log::error!("Drain after settling deferred {} failed: {}", id, err);
    }
}

pub(crate) fn clear() {
    let dropped = DEFERREDS.with(|deferreds| {
        let mut deferreds = deferreds.borrow_mut();
        let dropped = deferreds.len();
        deferreds.clear();
        dropped
    });
    if dropped > 0 {
        log::debug!("Dropped {} unsettled deferred(s)", dropped);
    }
}
