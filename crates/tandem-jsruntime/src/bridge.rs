//! Value bridge between host values and V8 values
//!
//! `to_host` classifies an engine value and builds the matching wrapper.
//! Scalars are copied. Functions, arrays, promises and plain objects become
//! `JsObjectRef` wrappers whose handle is rooted in the liveness registry,
//! so member access stays lazy and engine identity is preserved.
//!
//! `to_engine` is the dual. Host lists and dicts are copied into new engine
//! arrays and objects, host callables become shims, and `JsObjectRef`
//! wrappers resolve back to the very object they were created from.
//!
//! Engine exceptions raised mid-conversion (a throwing Date accessor, a
//! throwing getter) are captured and returned as `HostError::Script`.

use deno_core::v8;
use tandem_runtime::{EngineDateFields, HostError, HostResult, HostValue, Payload, TypeTag};

use crate::objects::{host_function_to_engine, JsObjectRef};
use crate::registry;

/// Largest integer a JS number represents exactly: 2^53 - 1
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

const DATE_GETTERS: [&str; 7] = [
    "getFullYear",
    "getMonth",
    "getDate",
    "getHours",
    "getMinutes",
    "getSeconds",
    "getMilliseconds",
];

/// Engine value kinds the marshaler distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Undefined,
    Null,
    Boolean,
    Number,
    BigInt,
    String,
    Symbol,
    Date,
    Function,
    Promise,
    Array,
    Object,
    Unsupported,
}

pub fn classify(value: v8::Local<v8::Value>) -> EngineKind {
    if value.is_undefined() {
        EngineKind::Undefined
    } else if value.is_null() {
        EngineKind::Null
    } else if value.is_boolean() {
        EngineKind::Boolean
    } else if value.is_number() {
        EngineKind::Number
    } else if value.is_big_int() {
        EngineKind::BigInt
    } else if value.is_string() {
        EngineKind::String
    } else if value.is_symbol() {
        EngineKind::Symbol
    } else if value.is_date() {
        EngineKind::Date
    } else if value.is_function() {
        EngineKind::Function
    } else if value.is_promise() {
        EngineKind::Promise
    } else if value.is_array() {
        EngineKind::Array
    } else if value.is_object() {
        EngineKind::Object
    } else {
        EngineKind::Unsupported
    }
}

/// Convert an engine value into a host wrapper.
pub fn to_host<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> HostResult<HostValue> {
    match classify(value) {
        EngineKind::Undefined => Ok(HostValue::none()),
        EngineKind::Null => Ok(HostValue::null()),
        EngineKind::Boolean => Ok(HostValue::bool(value.is_true())),
        EngineKind::Number => {
            let number = v8::Local::<v8::Number>::try_from(value)
                .map_err(|_| HostError::marshal("number", "not a number"))?;
            Ok(number_to_host(number.value()))
        }
        EngineKind::BigInt => {
            let bigint = v8::Local::<v8::BigInt>::try_from(value)
                .map_err(|_| HostError::marshal("bigint", "not a BigInt"))?;
            match bigint.i64_value() {
                (i, true) => Ok(HostValue::bigint(i)),
                (_, false) => Err(HostError::marshal("bigint", "value does not fit in 64 bits")),
            }
        }
        EngineKind::String => {
            let string = v8::Local::<v8::String>::try_from(value)
                .map_err(|_| HostError::marshal("string", "not a string"))?;
            let mut units = vec![0u16; string.length()];
            string.write(scope, &mut units, 0, v8::WriteOptions::NO_NULL_TERMINATION);
            Ok(HostValue::from_utf16(units))
        }
        EngineKind::Symbol => Err(HostError::marshal(
            "symbol",
            "symbols have no host representation",
        )),
        EngineKind::Date => date_to_host(scope, value),
        EngineKind::Function => Ok(root_object(scope, value, TypeTag::Function)),
        EngineKind::Promise => Ok(root_object(scope, value, TypeTag::Promise)),
        EngineKind::Array => Ok(root_object(scope, value, TypeTag::Array)),
        EngineKind::Object => Ok(root_object(scope, value, TypeTag::Object)),
        EngineKind::Unsupported => {
            let kind = value.type_of(scope).to_rust_string_lossy(scope);
            Err(HostError::marshal(kind, "no host representation"))
        }
    }
}

/// Integral numbers inside the safe range become `Int`; everything else,
/// including -0, stays `Float`.
fn number_to_host(n: f64) -> HostValue {
    let integral = n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64;
    if integral && !(n == 0.0 && n.is_sign_negative()) {
        HostValue::int(n as i64)
    } else {
        HostValue::float(n)
    }
}

fn root_object(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>, kind: TypeTag) -> HostValue {
    let global = v8::Global::new(scope, value);
    registry::with_registry(|registry| {
        registry.root_with(global, |id| {
            HostValue::foreign(JsObjectRef::new(id, None, kind), kind)
        })
    })
}

fn date_to_host<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> HostResult<HostValue> {
    let date = v8::Local::<v8::Object>::try_from(value)
        .map_err(|_| HostError::marshal("date", "not an object"))?;
    let mut raw = [0f64; 7];
    for (slot, getter) in raw.iter_mut().zip(DATE_GETTERS) {
        let component = call_method(scope, date, getter, &[])?;
        *slot = component.number_value(scope).unwrap_or(f64::NAN);
    }
    let fields = EngineDateFields::from_engine(raw)?;
    Ok(HostValue::date(fields.to_naive()?))
}

/// Convert a host value into an engine value.
pub fn to_engine<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &HostValue,
) -> HostResult<v8::Local<'s, v8::Value>> {
    to_engine_bounded(scope, value, crate::max_marshal_depth())
}

fn to_engine_bounded<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &HostValue,
    depth: usize,
) -> HostResult<v8::Local<'s, v8::Value>> {
    match value.payload() {
        Payload::None => Ok(v8::undefined(scope).into()),
        Payload::Null => Ok(v8::null(scope).into()),
        Payload::Bool(b) => Ok(v8::Boolean::new(scope, *b).into()),
        Payload::Int(i) => {
            if value.tag() == Some(TypeTag::BigInt) || i.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                Ok(v8::BigInt::new_from_i64(scope, *i).into())
            } else {
                Ok(v8::Number::new(scope, *i as f64).into())
            }
        }
        Payload::Float(f) => Ok(v8::Number::new(scope, *f).into()),
        Payload::Str(s) => {
            v8::String::new_from_two_byte(scope, s.as_utf16(), v8::NewStringType::Normal)
                .map(Into::into)
                .ok_or_else(|| HostError::marshal("str", "string exceeds the engine's maximum length"))
        }
        Payload::Date(dt) => date_to_engine(scope, &EngineDateFields::from_naive(dt)),
        Payload::List(items) => {
            if depth == 0 {
                return Err(HostError::marshal("list", "nesting exceeds max_marshal_depth"));
            }
            // Copy out so no borrow is held while the engine runs
            let items = items.borrow().clone();
            let array = v8::Array::new(scope, items.len() as i32);
            for (i, item) in items.iter().enumerate() {
                let element = to_engine_bounded(scope, item, depth - 1)?;
                array.set_index(scope, i as u32, element);
            }
            Ok(array.into())
        }
        Payload::Dict(entries) => {
            if depth == 0 {
                return Err(HostError::marshal("dict", "nesting exceeds max_marshal_depth"));
            }
            let entries = entries.borrow().clone();
            let object = v8::Object::new(scope);
            for (key, item) in &entries {
                let key = engine_string(scope, key)?;
                let element = to_engine_bounded(scope, item, depth - 1)?;
                object.set(scope, key.into(), element);
            }
            Ok(object.into())
        }
        Payload::Function(_) => host_function_to_engine(scope, value),
        Payload::Foreign(object) => match object.as_any().downcast_ref::<JsObjectRef>() {
            Some(js_object) => js_object.open(scope),
            None => Err(HostError::marshal(
                object.type_name(),
                "foreign objects cannot cross into the engine",
            )),
        },
    }
}

/// Build the Date from local components. `setFullYear` runs last so years
/// 0..=99 are not mapped onto 1900..=1999.
fn date_to_engine<'s>(
    scope: &mut v8::HandleScope<'s>,
    fields: &EngineDateFields,
) -> HostResult<v8::Local<'s, v8::Value>> {
    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = engine_string(scope, "Date")?;
    let constructor = global
        .get(scope, key.into())
        .and_then(|ctor| v8::Local::<v8::Function>::try_from(ctor).ok())
        .ok_or_else(|| HostError::Engine("global Date constructor is missing".to_string()))?;

    let time: Vec<v8::Local<v8::Value>> = [
        2000.0,
        0.0,
        1.0,
        fields.hour as f64,
        fields.minute as f64,
        fields.second as f64,
        fields.millisecond as f64,
    ]
    .iter()
    .map(|n| v8::Number::new(scope, *n).into())
    .collect();

    let date = {
        let tc = &mut v8::TryCatch::new(scope);
        constructor
            .new_instance(tc, &time)
            .ok_or_else(|| capture_exception(tc))?
    };
    let ymd: Vec<v8::Local<v8::Value>> = [fields.year as f64, fields.month0 as f64, fields.day as f64]
        .iter()
        .map(|n| v8::Number::new(scope, *n).into())
        .collect();
    call_method(scope, date, "setFullYear", &ymd)?;
    Ok(date.into())
}

/// Call `receiver[name](...args)`, capturing any exception.
pub(crate) fn call_method<'s>(
    scope: &mut v8::HandleScope<'s>,
    receiver: v8::Local<'s, v8::Object>,
    name: &str,
    args: &[v8::Local<'s, v8::Value>],
) -> HostResult<v8::Local<'s, v8::Value>> {
    let key = engine_string(scope, name)?;
    let tc = &mut v8::TryCatch::new(scope);
    let member = receiver
        .get(tc, key.into())
        .ok_or_else(|| capture_exception(tc))?;
    let method = v8::Local::<v8::Function>::try_from(member)
        .map_err(|_| HostError::Type(format!("'{}' is not a function", name)))?;
    method
        .call(tc, receiver.into(), args)
        .ok_or_else(|| capture_exception(tc))
}

pub(crate) fn engine_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    s: &str,
) -> HostResult<v8::Local<'s, v8::String>> {
    v8::String::new(scope, s)
        .ok_or_else(|| HostError::marshal("str", "string exceeds the engine's maximum length"))
}

/// Turn the exception caught by `tc` into a host error.
pub(crate) fn capture_exception(tc: &mut v8::TryCatch<v8::HandleScope>) -> HostError {
    let Some(exception) = tc.exception() else {
        return HostError::Engine("engine call failed without an exception".to_string());
    };
    if let Ok(object) = v8::Local::<v8::Object>::try_from(exception) {
        let name = read_string_property(tc, object, "name");
        let message = read_string_property(tc, object, "message");
        if let (Some(name), Some(message)) = (name, message) {
            return HostError::Script { name, message };
        }
    }
    let message = exception.to_rust_string_lossy(tc);
    HostError::Script {
        name: "Error".to_string(),
        message,
    }
}

fn read_string_property(
    scope: &mut v8::HandleScope,
    object: v8::Local<v8::Object>,
    name: &str,
) -> Option<String> {
    let key = v8::String::new(scope, name)?;
    let value = object.get(scope, key.into())?;
    if value.is_string() {
        Some(value.to_rust_string_lossy(scope))
    } else {
        None
    }
}
