//! Host value representation
//!
//! A `HostValue` is a reference-counted wrapper that owns exactly one payload
//! and optionally remembers which engine shape produced it (`TypeTag`). The
//! engine bridge never frees a `HostValue`; it only reads `ref_count()` to
//! decide whether the host still references a wrapper.
//!
//! Compound values created by the engine are `Payload::Foreign` objects that
//! forward member access back into the engine. Compound values created by the
//! host (`List`, `Dict`) are copied when they cross into the engine.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use chrono::NaiveDateTime;
use indexmap::IndexMap;

use crate::error::{HostError, HostResult};
use crate::string::HostString;

/// Which engine shape a wrapper was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Undefined,
    Null,
    Bool,
    Int,
    Float,
    BigInt,
    Str,
    Date,
    Function,
    Object,
    Array,
    Promise,
}

/// Host callable. Arguments are borrowed; the result is a new value.
pub type HostFn = Rc<dyn Fn(&[HostValue]) -> HostResult<HostValue>>;

/// An object whose state lives outside the host, e.g. in the script engine.
///
/// Every operation defaults to a type error so implementors only provide
/// what their object supports.
pub trait ForeignObject {
    fn type_name(&self) -> &'static str;

    fn call(&self, _args: &[HostValue]) -> HostResult<HostValue> {
        Err(HostError::Type(format!(
            "'{}' object is not callable",
            self.type_name()
        )))
    }

    fn get_attr(&self, name: &str) -> HostResult<HostValue> {
        Err(HostError::Type(format!(
            "'{}' object has no attribute '{}'",
            self.type_name(),
            name
        )))
    }

    fn set_attr(&self, name: &str, _value: HostValue) -> HostResult<()> {
        Err(HostError::Type(format!(
            "'{}' object does not support setting '{}'",
            self.type_name(),
            name
        )))
    }

    fn get_item(&self, _key: &HostValue) -> HostResult<HostValue> {
        Err(HostError::Type(format!(
            "'{}' object is not subscriptable",
            self.type_name()
        )))
    }

    fn len(&self) -> HostResult<usize> {
        Err(HostError::Type(format!(
            "object of type '{}' has no len()",
            self.type_name()
        )))
    }

    fn keys(&self) -> HostResult<Vec<String>> {
        Err(HostError::Type(format!(
            "'{}' object has no keys",
            self.type_name()
        )))
    }

    fn as_any(&self) -> &dyn Any;
}

pub enum Payload {
    /// The engine's `undefined`
    None,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(HostString),
    Date(NaiveDateTime),
    List(RefCell<Vec<HostValue>>),
    Dict(RefCell<IndexMap<String, HostValue>>),
    Function(HostFn),
    Foreign(Box<dyn ForeignObject>),
}

struct HostObject {
    payload: Payload,
    tag: Option<TypeTag>,
}

#[derive(Clone)]
pub struct HostValue(Rc<HostObject>);

#[derive(Clone)]
pub struct WeakHostValue(Weak<HostObject>);

thread_local! {
    static NONE: HostValue = HostValue::with_tag(Payload::None, TypeTag::Undefined);
    static NULL: HostValue = HostValue::with_tag(Payload::Null, TypeTag::Null);
}

impl HostValue {
    pub fn new(payload: Payload) -> Self {
        HostValue(Rc::new(HostObject { payload, tag: None }))
    }

    pub fn with_tag(payload: Payload, tag: TypeTag) -> Self {
        HostValue(Rc::new(HostObject {
            payload,
            tag: Some(tag),
        }))
    }

    /// The shared `undefined` singleton.
    pub fn none() -> Self {
        NONE.with(|v| v.clone())
    }

    /// The shared `null` singleton.
    pub fn null() -> Self {
        NULL.with(|v| v.clone())
    }

    pub fn bool(b: bool) -> Self {
        HostValue::with_tag(Payload::Bool(b), TypeTag::Bool)
    }

    pub fn int(i: i64) -> Self {
        HostValue::with_tag(Payload::Int(i), TypeTag::Int)
    }

    /// An integer that should become a BigInt in the engine.
    pub fn bigint(i: i64) -> Self {
        HostValue::with_tag(Payload::Int(i), TypeTag::BigInt)
    }

    pub fn float(f: f64) -> Self {
        HostValue::with_tag(Payload::Float(f), TypeTag::Float)
    }

    pub fn string(s: &str) -> Self {
        HostValue::with_tag(Payload::Str(HostString::from(s)), TypeTag::Str)
    }

    pub fn from_utf16(units: Vec<u16>) -> Self {
        HostValue::with_tag(Payload::Str(HostString::from_utf16(units)), TypeTag::Str)
    }

    pub fn date(dt: NaiveDateTime) -> Self {
        HostValue::with_tag(Payload::Date(dt), TypeTag::Date)
    }

    pub fn list(items: Vec<HostValue>) -> Self {
        HostValue::new(Payload::List(RefCell::new(items)))
    }

    pub fn dict(entries: IndexMap<String, HostValue>) -> Self {
        HostValue::new(Payload::Dict(RefCell::new(entries)))
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[HostValue]) -> HostResult<HostValue> + 'static,
    {
        HostValue::new(Payload::Function(Rc::new(f)))
    }

    pub fn foreign<T: ForeignObject + 'static>(object: T, tag: TypeTag) -> Self {
        HostValue::with_tag(Payload::Foreign(Box::new(object)), tag)
    }

    pub fn payload(&self) -> &Payload {
        &self.0.payload
    }

    pub fn tag(&self) -> Option<TypeTag> {
        self.0.tag
    }

    /// Number of strong references to this wrapper, including this one.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &HostValue) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address of the wrapper while it is alive.
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn downgrade(&self) -> WeakHostValue {
        WeakHostValue(Rc::downgrade(&self.0))
    }

    pub fn type_name(&self) -> &'static str {
        match self.payload() {
            Payload::None => "undefined",
            Payload::Null => "null",
            Payload::Bool(_) => "bool",
            Payload::Int(_) => "int",
            Payload::Float(_) => "float",
            Payload::Str(_) => "str",
            Payload::Date(_) => "datetime",
            Payload::List(_) => "list",
            Payload::Dict(_) => "dict",
            Payload::Function(_) => "function",
            Payload::Foreign(obj) => obj.type_name(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.payload(), Payload::None)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.payload(), Payload::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.payload() {
            Payload::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.payload() {
            Payload::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of `Int` and `Float` payloads.
    pub fn as_f64(&self) -> Option<f64> {
        match self.payload() {
            Payload::Int(i) => Some(*i as f64),
            Payload::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&HostString> {
        match self.payload() {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&NaiveDateTime> {
        match self.payload() {
            Payload::Date(dt) => Some(dt),
            _ => None,
        }
    }

    /// Downcast a foreign payload to its concrete type.
    pub fn as_foreign<T: 'static>(&self) -> Option<&T> {
        match self.payload() {
            Payload::Foreign(obj) => obj.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn call(&self, args: &[HostValue]) -> HostResult<HostValue> {
        match self.payload() {
            Payload::Function(f) => f(args),
            Payload::Foreign(obj) => obj.call(args),
            _ => Err(HostError::Type(format!(
                "'{}' object is not callable",
                self.type_name()
            ))),
        }
    }

    pub fn get_attr(&self, name: &str) -> HostResult<HostValue> {
        match self.payload() {
            Payload::Dict(entries) => entries.borrow().get(name).cloned().ok_or_else(|| {
                HostError::Type(format!("dict has no key '{}'", name))
            }),
            Payload::Foreign(obj) => obj.get_attr(name),
            _ => Err(HostError::Type(format!(
                "'{}' object has no attribute '{}'",
                self.type_name(),
                name
            ))),
        }
    }

    pub fn set_attr(&self, name: &str, value: HostValue) -> HostResult<()> {
        match self.payload() {
            Payload::Dict(entries) => {
                entries.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Payload::Foreign(obj) => obj.set_attr(name, value),
            _ => Err(HostError::Type(format!(
                "'{}' object does not support setting '{}'",
                self.type_name(),
                name
            ))),
        }
    }

    pub fn get_item(&self, key: &HostValue) -> HostResult<HostValue> {
        match (self.payload(), key.payload()) {
            (Payload::List(items), Payload::Int(i)) => {
                let items = items.borrow();
                usize::try_from(*i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| HostError::Type(format!("list index {} out of range", i)))
            }
            (Payload::Dict(_), Payload::Str(s)) => self.get_attr(&s.to_string_lossy()),
            (Payload::Foreign(obj), _) => obj.get_item(key),
            _ => Err(HostError::Type(format!(
                "'{}' object cannot be indexed by '{}'",
                self.type_name(),
                key.type_name()
            ))),
        }
    }

    pub fn len(&self) -> HostResult<usize> {
        match self.payload() {
            Payload::Str(s) => Ok(s.len()),
            Payload::List(items) => Ok(items.borrow().len()),
            Payload::Dict(entries) => Ok(entries.borrow().len()),
            Payload::Foreign(obj) => obj.len(),
            _ => Err(HostError::Type(format!(
                "object of type '{}' has no len()",
                self.type_name()
            ))),
        }
    }

    pub fn keys(&self) -> HostResult<Vec<String>> {
        match self.payload() {
            Payload::Dict(entries) => Ok(entries.borrow().keys().cloned().collect()),
            Payload::Foreign(obj) => obj.keys(),
            _ => Err(HostError::Type(format!(
                "'{}' object has no keys",
                self.type_name()
            ))),
        }
    }
}

impl WeakHostValue {
    pub fn upgrade(&self) -> Option<HostValue> {
        self.0.upgrade().map(HostValue)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Value equality. Numbers compare numerically across `Int` and `Float`,
/// functions and foreign objects compare by identity.
impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (self.payload(), other.payload()) {
            (Payload::None, Payload::None) | (Payload::Null, Payload::Null) => true,
            (Payload::Bool(a), Payload::Bool(b)) => a == b,
            (Payload::Int(a), Payload::Int(b)) => a == b,
            (Payload::Float(a), Payload::Float(b)) => a == b,
            (Payload::Int(a), Payload::Float(b)) | (Payload::Float(b), Payload::Int(a)) => {
                int_equals_float(*a, *b)
            }
            (Payload::Str(a), Payload::Str(b)) => a == b,
            (Payload::Date(a), Payload::Date(b)) => a == b,
            (Payload::List(a), Payload::List(b)) => *a.borrow() == *b.borrow(),
            (Payload::Dict(a), Payload::Dict(b)) => *a.borrow() == *b.borrow(),
            _ => false,
        }
    }
}

/// Exact comparison: the float must be integral and inside the `i64` range,
/// otherwise rounding the int would make equality non-transitive.
fn int_equals_float(i: i64, f: f64) -> bool {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    f.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&f) && f as i64 == i
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload() {
            Payload::None => f.write_str("undefined"),
            Payload::Null => f.write_str("null"),
            Payload::Bool(b) => write!(f, "{}", b),
            Payload::Int(i) if self.tag() == Some(TypeTag::BigInt) => write!(f, "{}n", i),
            Payload::Int(i) => write!(f, "{}", i),
            Payload::Float(x) => write!(f, "{:?}", x),
            Payload::Str(s) => write!(f, "{:?}", s),
            Payload::Date(dt) => write!(f, "datetime({})", dt),
            Payload::List(items) => f.debug_list().entries(items.borrow().iter()).finish(),
            Payload::Dict(entries) => f.debug_map().entries(entries.borrow().iter()).finish(),
            Payload::Function(_) => f.write_str("<function>"),
            Payload::Foreign(obj) => write!(f, "<{}>", obj.type_name()),
        }
    }
}

/// Scalar values that may be created on one thread and materialised as a
/// `HostValue` on the script thread.
#[derive(Debug, Clone, PartialEq)]
pub enum SendValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl SendValue {
    pub fn into_host(self) -> HostValue {
        match self {
            SendValue::Undefined => HostValue::none(),
            SendValue::Null => HostValue::null(),
            SendValue::Bool(b) => HostValue::bool(b),
            SendValue::Int(i) => HostValue::int(i),
            SendValue::Float(f) => HostValue::float(f),
            SendValue::Str(s) => HostValue::string(&s),
        }
    }
}
