//! Engine objects seen from the host, and host functions seen from the engine.
//!
//! `JsObjectRef` is the foreign payload of every wrapper produced for an
//! engine function, array, promise or plain object. It only stores handle
//! ids; the liveness registry owns the rooted handles. Members are marshaled
//! lazily on access.
//!
//! Host callables passed into the engine become V8 functions backed by
//! `host_function_trampoline`. The shim table keeps the callable alive for as
//! long as the V8 function is; a weak finalizer marks the entry for removal at
//! the next registry sweep.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use deno_core::v8;
use tandem_runtime::{ForeignObject, HostError, HostResult, HostValue, Payload, TypeTag};

use crate::bridge::{capture_exception, engine_string, to_engine, to_host};
use crate::registry::{self, HandleId};
use crate::{enter_scope, with_scope};

pub struct JsObjectRef {
    handle: HandleId,
    /// `this` for calls, when the function was read off an object
    receiver: Option<HandleId>,
    kind: TypeTag,
}

impl JsObjectRef {
    pub(crate) fn new(handle: HandleId, receiver: Option<HandleId>, kind: TypeTag) -> Self {
        Self {
            handle,
            receiver,
            kind,
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn receiver(&self) -> Option<HandleId> {
        self.receiver
    }

    pub fn kind(&self) -> TypeTag {
        self.kind
    }

    /// Open the underlying engine value in `scope`.
    pub(crate) fn open<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> HostResult<v8::Local<'s, v8::Value>> {
        registry::local(scope, self.handle).ok_or_else(|| {
            HostError::Engine(format!("engine handle {} has been released", self.handle))
        })
    }

    fn open_object<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> HostResult<v8::Local<'s, v8::Object>> {
        let value = self.open(scope)?;
        v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| HostError::Type(format!("'{}' is not an object", self.type_name())))
    }
}

impl ForeignObject for JsObjectRef {
    fn type_name(&self) -> &'static str {
        match self.kind {
            TypeTag::Function => "JsFunction",
            TypeTag::Array => "JsArray",
            TypeTag::Promise => "JsPromise",
            _ => "JsObject",
        }
    }

    fn call(&self, args: &[HostValue]) -> HostResult<HostValue> {
        with_scope(|scope| {
            let value = self.open(scope)?;
            let func = v8::Local::<v8::Function>::try_from(value).map_err(|_| {
                HostError::Type(format!("'{}' object is not callable", self.type_name()))
            })?;
            let recv = match self.receiver {
                Some(id) => registry::local(scope, id).ok_or_else(|| {
                    HostError::Engine(format!("receiver handle {} has been released", id))
                })?,
                None => v8::undefined(scope).into(),
            };
            let mut engine_args = Vec::with_capacity(args.len());
            for arg in args {
                engine_args.push(to_engine(scope, arg)?);
            }

            let tc = &mut v8::TryCatch::new(scope);
            let result = func
                .call(tc, recv, &engine_args)
                .ok_or_else(|| capture_exception(tc))?;
            to_host(tc, result)
        })?
    }

    fn get_attr(&self, name: &str) -> HostResult<HostValue> {
        with_scope(|scope| {
            let object = self.open_object(scope)?;
            let key = engine_string(scope, name)?;
            let tc = &mut v8::TryCatch::new(scope);
            let value = object
                .get(tc, key.into())
                .ok_or_else(|| capture_exception(tc))?;
            if value.is_function() {
                // Methods keep their object alive and use it as `this`
                let global = v8::Global::new(tc, value);
                let parent = self.handle;
                let method = registry::with_registry(|registry| {
                    let method = registry.root_with(global, |id| {
                        HostValue::foreign(
                            JsObjectRef::new(id, Some(parent), TypeTag::Function),
                            TypeTag::Function,
                        )
                    });
                    registry.register(&method, parent);
                    method
                });
                return Ok(method);
            }
            to_host(tc, value)
        })?
    }

    fn set_attr(&self, name: &str, value: HostValue) -> HostResult<()> {
        with_scope(|scope| {
            let object = self.open_object(scope)?;
            let key = engine_string(scope, name)?;
            let value = to_engine(scope, &value)?;
            let tc = &mut v8::TryCatch::new(scope);
            match object.set(tc, key.into(), value) {
                Some(_) => Ok(()),
                None => Err(capture_exception(tc)),
            }
        })?
    }

    fn get_item(&self, key: &HostValue) -> HostResult<HostValue> {
        if let Payload::Str(name) = key.payload() {
            return self.get_attr(&name.to_rust_string()?);
        }
        let index = match key.payload() {
            Payload::Int(i) => u32::try_from(*i)
                .map_err(|_| HostError::Type(format!("index {} out of range", i)))?,
            _ => {
                return Err(HostError::Type(format!(
                    "'{}' indices must be integers or strings, not {}",
                    self.type_name(),
                    key.type_name()
                )))
            }
        };
        with_scope(|scope| {
            let object = self.open_object(scope)?;
            let tc = &mut v8::TryCatch::new(scope);
            let value = object
                .get_index(tc, index)
                .ok_or_else(|| capture_exception(tc))?;
            to_host(tc, value)
        })?
    }

    fn len(&self) -> HostResult<usize> {
        with_scope(|scope| {
            let value = self.open(scope)?;
            if let Ok(array) = v8::Local::<v8::Array>::try_from(value) {
                return Ok(array.length() as usize);
            }
            let object = self.open_object(scope)?;
            Ok(own_keys(scope, object)?.len())
        })?
    }

    fn keys(&self) -> HostResult<Vec<String>> {
        with_scope(|scope| {
            let object = self.open_object(scope)?;
            own_keys(scope, object)
        })?
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn own_keys(scope: &mut v8::HandleScope, object: v8::Local<v8::Object>) -> HostResult<Vec<String>> {
    let tc = &mut v8::TryCatch::new(scope);
    let names = object
        .get_own_property_names(tc, v8::GetPropertyNamesArgs::default())
        .ok_or_else(|| capture_exception(tc))?;
    let mut keys = Vec::with_capacity(names.length() as usize);
    for i in 0..names.length() {
        let name = names.get_index(tc, i).ok_or_else(|| capture_exception(tc))?;
        keys.push(name.to_rust_string_lossy(tc));
    }
    Ok(keys)
}

// ---------------------------------------------------------------------------
// Host function shims
// ---------------------------------------------------------------------------

struct HostFunctionEntry {
    callable: HostValue,
    shim: v8::Weak<v8::Function>,
}

thread_local! {
    static HOST_FUNCTIONS: RefCell<HashMap<u64, HostFunctionEntry>> = RefCell::new(HashMap::new());
    /// Callable address -> shim id, so one callable maps to one engine function
    static SHIM_BY_CALLABLE: RefCell<HashMap<usize, u64>> = RefCell::new(HashMap::new());
    /// Shims whose V8 function has been collected
    static RELEASED: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
    static NEXT_SHIM_ID: Cell<u64> = const { Cell::new(1) };
}

/// Engine function for a host callable. Reuses the existing shim while its
/// V8 function is alive.
pub(crate) fn host_function_to_engine<'s>(
    scope: &mut v8::HandleScope<'s>,
    callable: &HostValue,
) -> HostResult<v8::Local<'s, v8::Value>> {
    let existing = SHIM_BY_CALLABLE.with(|by| by.borrow().get(&callable.addr()).copied());
    if let Some(id) = existing {
        let live = HOST_FUNCTIONS.with(|table| {
            table
                .borrow()
                .get(&id)
                .and_then(|entry| entry.shim.to_local(scope))
        });
        if let Some(func) = live {
            return Ok(func.into());
        }
    }

    let id = NEXT_SHIM_ID.with(|next| {
        let current = next.get();
        next.set(current + 1);
        current
    });
    let data = v8::Number::new(scope, id as f64);
    let func = v8::Function::builder(host_function_trampoline)
        .data(data.into())
        .build(scope)
        .ok_or_else(|| HostError::Engine("failed to create host function shim".to_string()))?;
    let shim = v8::Weak::with_finalizer(
        scope,
        func,
        Box::new(move |_| {
            let _ = RELEASED.try_with(|released| released.borrow_mut().push(id));
        }),
    );

    HOST_FUNCTIONS.with(|table| {
        table.borrow_mut().insert(
            id,
            HostFunctionEntry {
                callable: callable.clone(),
                shim,
            },
        )
    });
    SHIM_BY_CALLABLE.with(|by| by.borrow_mut().insert(callable.addr(), id));
    Ok(func.into())
}

/// Drop table entries for shims the engine has collected. Returns how many.
pub(crate) fn purge_released_functions() -> usize {
    let Ok(Some(ids)) = RELEASED.try_with(|released| {
        released
            .try_borrow_mut()
            .ok()
            .map(|mut released| std::mem::take(&mut *released))
    }) else {
        return 0;
    };
    if ids.is_empty() {
        return 0;
    }

    let removed: Vec<HostFunctionEntry> = HOST_FUNCTIONS.with(|table| {
        let mut table = table.borrow_mut();
        ids.iter().filter_map(|id| table.remove(id)).collect()
    });
    SHIM_BY_CALLABLE.with(|by| {
        let mut by = by.borrow_mut();
        for entry in &removed {
            if by.get(&entry.callable.addr()).is_some_and(|id| ids.contains(id)) {
                by.remove(&entry.callable.addr());
            }
        }
    });
    removed.len()
}

/// Number of live host function shims.
pub fn host_function_count() -> usize {
    HOST_FUNCTIONS.with(|table| table.borrow().len())
}

pub(crate) fn clear_host_functions() {
    let entries: Vec<HostFunctionEntry> =
        HOST_FUNCTIONS.with(|table| table.borrow_mut().drain().map(|(_, e)| e).collect());
    SHIM_BY_CALLABLE.with(|by| by.borrow_mut().clear());
    RELEASED.with(|released| released.borrow_mut().clear());
    drop(entries);
}

fn host_function_trampoline<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut retval: v8::ReturnValue,
) {
    let id = args
        .data()
        .number_value(scope)
        .map(|n| n as u64)
        .unwrap_or(0);
    let callable = HOST_FUNCTIONS.with(|table| {
        table
            .borrow()
            .get(&id)
            .map(|entry| entry.callable.clone())
    });
    let Some(callable) = callable else {
        log::error!("Host function shim {} not found", id);
        throw_error(scope, "host function has been released");
        return;
    };

    let result = enter_scope(scope, |scope| {
        let mut host_args = Vec::with_capacity(args.length() as usize);
        for i in 0..args.length() {
            host_args.push(to_host(scope, args.get(i))?);
        }
        let output = callable.call(&host_args)?;
        to_engine(scope, &output)
    });

    match result {
        Ok(value) => retval.set(value),
        Err(err) => throw_error(scope, &err.to_string()),
    }
}

pub(crate) fn throw_error(scope: &mut v8::HandleScope, message: &str) {
    let message = v8::String::new(scope, message).unwrap_or_else(|| v8::String::empty(scope));
    let exception = v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::{js_collect, js_eval};
    use crate::{js_runtime_init, js_runtime_shutdown, RuntimeConfig};

    fn setup() {
        let _ = env_logger::builder().is_test(true).try_init();
        js_runtime_init(RuntimeConfig::default(), None).unwrap();
    }

    #[test]
    fn test_method_keeps_receiver() {
        setup();
        let counter = js_eval("({ n: 41, bump() { return ++this.n; } })").unwrap();
        let bump = counter.get_attr("bump").unwrap();
        drop(counter);
        js_collect().unwrap();
        assert_eq!(bump.call(&[]).unwrap().as_int(), Some(42));
        js_runtime_shutdown();
    }

    #[test]
    fn test_array_access() {
        setup();
        let array = js_eval("[10, 'x', null]").unwrap();
        assert_eq!(array.tag(), Some(TypeTag::Array));
        assert_eq!(array.len().unwrap(), 3);
        assert_eq!(array.get_item(&HostValue::int(0)).unwrap().as_int(), Some(10));
        assert_eq!(array.get_item(&HostValue::int(1)).unwrap(), HostValue::string("x"));
        assert!(array.get_item(&HostValue::int(2)).unwrap().is_null());
        assert!(array.get_item(&HostValue::int(9)).unwrap().is_none());
        js_runtime_shutdown();
    }

    #[test]
    fn test_object_attributes() {
        setup();
        let object = js_eval("({ a: 1, b: 'two' })").unwrap();
        assert_eq!(object.keys().unwrap(), vec!["a", "b"]);
        object.set_attr("c", HostValue::float(2.5)).unwrap();
        assert_eq!(js_eval("1").unwrap().as_int(), Some(1));
        assert_eq!(object.get_attr("c").unwrap().as_f64(), Some(2.5));
        assert_eq!(object.len().unwrap(), 3);

        let getter = js_eval("({ get boom() { throw new RangeError('nope'); } })").unwrap();
        let err = getter.get_attr("boom").unwrap_err();
        assert_eq!(err, HostError::script("RangeError", "nope"));
        js_runtime_shutdown();
    }

    #[test]
    fn test_host_function_errors_become_exceptions() {
        setup();
        let check = js_eval("(f) => { try { f(); return 'no'; } catch (e) { return e.message; } }").unwrap();
        let failing = HostValue::function(|_| Err(HostError::Type("refused".to_string())));
        let message = check.call(&[failing]).unwrap();
        assert_eq!(message, HostValue::string("TypeError: refused"));
        js_runtime_shutdown();
    }

    #[test]
    fn test_host_function_reenters_engine() {
        setup();
        let double = js_eval("(x) => x * 2").unwrap();
        let via_host = HostValue::function(move |args| double.call(args));
        let apply = js_eval("(f, v) => f(v) + 1").unwrap();
        let out = apply.call(&[via_host.clone(), HostValue::int(20)]).unwrap();
        assert_eq!(out.as_int(), Some(41));

        // The same callable maps to the same engine function
        let same = js_eval("(a, b) => a === b").unwrap();
        assert_eq!(
            same.call(&[via_host.clone(), via_host]).unwrap().as_bool(),
            Some(true)
        );
        assert_eq!(host_function_count(), 1);
        js_runtime_shutdown();
        assert_eq!(host_function_count(), 0);
    }
}
