//! Host entry points into the engine
//!
//! Everything here runs on the script thread and initialises the runtime on
//! first use.

use deno_core::v8;
use tandem_runtime::{HostError, HostResult, HostValue};

use crate::bridge::{capture_exception, to_engine, to_host};
use crate::job_queue::{self, DrainReport};
use crate::registry::{self, SweepOutcome};
use crate::with_scope;

/// Compile and run `code` as a classic script, returning its completion value.
pub fn js_eval(code: &str) -> HostResult<HostValue> {
    with_scope(|scope| {
        let tc = &mut v8::TryCatch::new(scope);
        let source = v8::String::new(tc, code)
            .ok_or_else(|| HostError::marshal("str", "script source is too long"))?;
        let script = v8::Script::compile(tc, source, None).ok_or_else(|| capture_exception(tc))?;
        let result = script.run(tc).ok_or_else(|| capture_exception(tc))?;
        to_host(tc, result)
    })?
}

/// Sweep the liveness registry and force a full engine collection.
pub fn js_collect() -> HostResult<SweepOutcome> {
    let before = registry::sweep();
    with_scope(|scope| scope.low_memory_notification())?;
    // Shim finalizers run during the collection; pick them up now
    let after = registry::sweep();
    Ok(SweepOutcome {
        wrappers_pruned: before.wrappers_pruned + after.wrappers_pruned,
        handles_released: before.handles_released + after.handles_released,
    })
}

/// Drain the job queue.
pub fn js_run_jobs() -> HostResult<DrainReport> {
    with_scope(|scope| job_queue::run_jobs(scope))
}

pub fn js_job_queue_is_empty() -> bool {
    job_queue::is_empty()
}

/// Queue a host or engine callable as a job, optionally tied to `promise`.
///
/// Returns `Ok(false)` if the scheduler is shutting down and the job was
/// discarded.
pub fn js_enqueue_job(callback: &HostValue, promise: Option<&HostValue>) -> HostResult<bool> {
    with_scope(|scope| {
        let value = to_engine(scope, callback)?;
        let func = v8::Local::<v8::Function>::try_from(value).map_err(|_| {
            HostError::Type(format!("'{}' object is not callable", callback.type_name()))
        })?;
        let promise = match promise {
            Some(promise) => {
                let value = to_engine(scope, promise)?;
                let promise = v8::Local::<v8::Promise>::try_from(value).map_err(|_| {
                    HostError::Type(format!("'{}' object is not a promise", promise.type_name()))
                })?;
                Some(promise)
            }
            None => None,
        };
        job_queue::enqueue_job(scope, func, promise).map_err(|err| HostError::Engine(err.to_string()))
    })?
}

/// The engine's `typeof` for a host value.
pub fn js_typeof(value: &HostValue) -> HostResult<String> {
    with_scope(|scope| {
        let engine = to_engine(scope, value)?;
        Ok(engine.type_of(scope).to_rust_string_lossy(scope))
    })?
}

/// The engine's `new`. A string constructor is evaluated first, so
/// `js_new(&HostValue::string("Date"), ..)` constructs a `Date`.
pub fn js_new(ctor: &HostValue, args: &[HostValue]) -> HostResult<HostValue> {
    let ctor = match ctor.as_str() {
        Some(expr) => js_eval(&expr.to_rust_string()?)?,
        None => ctor.clone(),
    };
    with_scope(|scope| {
        let value = to_engine(scope, &ctor)?;
        let func = v8::Local::<v8::Function>::try_from(value).map_err(|_| {
            HostError::Type(format!("'{}' object is not a constructor", ctor.type_name()))
        })?;
        let mut engine_args = Vec::with_capacity(args.len());
        for arg in args {
            engine_args.push(to_engine(scope, arg)?);
        }
        let tc = &mut v8::TryCatch::new(scope);
        let object = func
            .new_instance(tc, &engine_args)
            .ok_or_else(|| capture_exception(tc))?;
        to_host(tc, object.into())
    })?
}

/// UTF-16 string to UCS-4 code points.
pub fn js_as_ucs4(value: &HostValue) -> HostResult<Vec<u32>> {
    tandem_runtime::as_ucs4(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{js_runtime_init, js_runtime_shutdown, RuntimeConfig};
    use std::cell::Cell;
    use std::rc::Rc;
    use tandem_runtime::TypeTag;

    fn setup() {
        let _ = env_logger::builder().is_test(true).try_init();
        js_runtime_init(RuntimeConfig::default(), None).unwrap();
    }

    #[test]
    fn test_eval_returns_completion_value() {
        setup();
        assert_eq!(js_eval("6 * 7").unwrap().as_int(), Some(42));
        assert_eq!(js_eval("'tan' + 'dem'").unwrap(), HostValue::string("tandem"));
        assert!(js_eval("undefined").unwrap().is_none());
        js_runtime_shutdown();
    }

    #[test]
    fn test_eval_errors_become_script_errors() {
        setup();
        let err = js_eval("throw new TypeError('bad input')").unwrap_err();
        assert_eq!(err, HostError::script("TypeError", "bad input"));

        let err = js_eval("let = ;").unwrap_err();
        assert!(matches!(err, HostError::Script { ref name, .. } if name == "SyntaxError"));

        let err = js_eval("throw 'plain'").unwrap_err();
        assert_eq!(err, HostError::script("Error", "plain"));
        js_runtime_shutdown();
    }

    #[test]
    fn test_queue_op_sees_pending_jobs() {
        setup();
        let empty = js_eval("Deno.core.ops.op_tandem_job_queue_is_empty()").unwrap();
        assert_eq!(empty.as_bool(), Some(true));
        let empty = js_eval(
            "queueMicrotask(() => {}); Deno.core.ops.op_tandem_job_queue_is_empty()",
        )
        .unwrap();
        assert_eq!(empty.as_bool(), Some(false));
        js_run_jobs().unwrap();
        assert!(js_job_queue_is_empty());
        js_runtime_shutdown();
    }

    #[test]
    fn test_typeof() {
        setup();
        assert_eq!(js_typeof(&HostValue::int(1)).unwrap(), "number");
        assert_eq!(js_typeof(&HostValue::none()).unwrap(), "undefined");
        assert_eq!(js_typeof(&HostValue::null()).unwrap(), "object");
        assert_eq!(js_typeof(&HostValue::bigint(1)).unwrap(), "bigint");
        let f = HostValue::function(|_| Ok(HostValue::none()));
        assert_eq!(js_typeof(&f).unwrap(), "function");
        js_runtime_shutdown();
    }

    #[test]
    fn test_new_from_name_and_value() {
        setup();
        let date = js_new(
            &HostValue::string("Date"),
            &[HostValue::int(2020), HostValue::int(1), HostValue::int(29)],
        )
        .unwrap();
        let dt = date.as_date().unwrap();
        assert_eq!(dt.to_string(), "2020-02-29 00:00:00");

        let point = js_eval("(class Point { constructor(x) { this.x = x; } })").unwrap();
        let p = js_new(&point, &[HostValue::int(3)]).unwrap();
        assert_eq!(p.tag(), Some(TypeTag::Object));
        assert_eq!(p.get_attr("x").unwrap().as_int(), Some(3));

        let err = js_new(&HostValue::int(3), &[]).unwrap_err();
        assert!(matches!(err, HostError::Type(_)));

        let err = js_new(&HostValue::string("Symbol"), &[]).unwrap_err();
        assert!(matches!(err, HostError::Script { ref name, .. } if name == "TypeError"));
        js_runtime_shutdown();
    }

    #[test]
    fn test_as_ucs4() {
        let s = HostValue::string("a\u{1F600}");
        assert_eq!(js_as_ucs4(&s).unwrap(), vec![0x61, 0x1F600]);
        assert!(matches!(js_as_ucs4(&HostValue::int(1)), Err(HostError::Type(_))));
    }

    #[test]
    fn test_enqueue_host_callable() {
        setup();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let job = HostValue::function(move |_| {
            counter.set(counter.get() + 1);
            Ok(HostValue::none())
        });
        assert!(js_enqueue_job(&job, None).unwrap());
        assert!(!js_job_queue_is_empty());
        assert_eq!(calls.get(), 0);

        let report = js_run_jobs().unwrap();
        assert_eq!(report.jobs_run, 1);
        assert_eq!(calls.get(), 1);
        assert!(js_job_queue_is_empty());

        let err = js_enqueue_job(&HostValue::int(1), None).unwrap_err();
        assert!(matches!(err, HostError::Type(_)));
        let err = js_enqueue_job(&job, Some(&HostValue::int(1))).unwrap_err();
        assert!(matches!(err, HostError::Type(_)));
        js_runtime_shutdown();
    }

    #[test]
    fn test_enqueue_with_promise() {
        setup();
        let promise = js_eval("Promise.resolve(1)").unwrap();
        let job = js_eval("() => { globalThis.ran = true; }").unwrap();
        assert!(js_enqueue_job(&job, Some(&promise)).unwrap());
        js_run_jobs().unwrap();
        assert_eq!(js_eval("globalThis.ran").unwrap().as_bool(), Some(true));
        js_runtime_shutdown();
    }

    #[test]
    fn test_collect_on_fresh_runtime() {
        setup();
        assert_eq!(js_collect().unwrap(), SweepOutcome::default());
        js_runtime_shutdown();
    }
}
