//! Tagged dynamic values and the per-type dispatch table.
//!
//! Every [`Value`] selects exactly one [`TypeOps`] descriptor. Built-in
//! variants use static zero-sized descriptors; [`Value::Object`] carries its
//! own descriptor through the [`Object`] trait object. Callers go through
//! [`Value::ops`] and never switch on the variant to decide how to hash, call,
//! dereference or assign.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::kinds;
use crate::{ErrorValue, NativeFn, TypeTag, VarCell};

/// Finalizer from splitmix64. Spreads pointer and small-integer keys.
pub fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn address_hash<T: ?Sized>(ptr: *const T) -> u64 {
    mix64(ptr as *const () as usize as u64)
}

/// Dispatch table shared by every value of one type.
///
/// Only `tag` and `hash` are mandatory; the remaining entries default to
/// producing a `TypeError` value. Operations never panic or return `Err`:
/// failures are reported as [`Value::Error`] results.
pub trait TypeOps: Send + Sync {
    /// Most-derived type tag of values using this table.
    fn tag(&self) -> TypeTag;

    /// Hash of `this`, consistent with `Value`'s equality.
    fn hash(&self, this: &Value) -> u64;

    /// Invokes `this` with `args`.
    fn call(&self, this: &Value, args: &[Value]) -> Value {
        let _ = args;
        Value::error(
            kinds::TYPE_ERROR,
            format!("{} is not callable", this.type_tag()),
        )
    }

    /// Reads through an assignable reference. Plain values dereference to themselves.
    fn dereference(&self, this: &Value) -> Value {
        this.clone()
    }

    /// Writes through an assignable reference and returns the stored value.
    fn assign(&self, this: &Value, value: Value) -> Value {
        let _ = value;
        Value::error(
            kinds::TYPE_ERROR,
            format!("{} is not assignable", this.type_tag()),
        )
    }
}

/// Downcasting support for [`Object`] implementors.
///
/// Implemented for every `Send + Sync + 'static` type; never implement it by hand.
pub trait AsAny {
    /// Borrows `self` as `Any`.
    fn as_any(&self) -> &dyn Any;
    /// Converts a shared handle into a shared `Any` handle.
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A heap value whose type lives outside this crate (closures, generators,
/// host objects).
///
/// The iteration hooks back the generic half of the iteration protocol: the
/// interpreter handles generators itself and delegates everything else here.
pub trait Object: TypeOps + AsAny + fmt::Debug {
    /// The dispatch table for this object, normally `self`.
    fn type_ops(&self) -> &dyn TypeOps;

    /// Human-readable rendering used by `Display`.
    fn describe(&self) -> String {
        format!("<{}>", self.tag())
    }

    /// Starts iteration: returns an iterator, or nil when there is nothing to visit.
    fn iterate(&self, this: &Value) -> Value {
        Value::error(
            kinds::TYPE_ERROR,
            format!("{} is not iterable", this.type_tag()),
        )
    }

    /// Advances an iterator: returns the next iterator or nil at the end.
    fn iterator_next(&self, this: &Value) -> Value {
        not_an_iterator(this)
    }

    /// Key (position) of the iterator's current element.
    fn iterator_key(&self, this: &Value) -> Value {
        not_an_iterator(this)
    }

    /// Current element of the iterator.
    fn iterator_value(&self, this: &Value) -> Value {
        not_an_iterator(this)
    }
}

fn not_an_iterator(this: &Value) -> Value {
    Value::error(
        kinds::TYPE_ERROR,
        format!("{} is not an iterator", this.type_tag()),
    )
}

/// A dynamically typed runtime value.
///
/// Shared payloads are reference counted, so cloning is cheap and every value
/// is `Send + Sync`. `Nil` doubles as the iteration end sentinel.
///
/// # Examples
///
/// ```
/// use core_types::Value;
///
/// let tuple = Value::tuple(vec![Value::Int(1), Value::str("two")]);
/// assert_eq!(tuple.to_string(), "(1, two)");
/// assert_eq!(tuple.hash_code(), tuple.clone().hash_code());
/// ```
#[derive(Clone, Debug)]
pub enum Value {
    /// The nil sentinel
    Nil,
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Real(f64),
    /// Immutable string
    Str(Arc<str>),
    /// Immutable tuple
    Tuple(Arc<[Value]>),
    /// Mutable variable cell
    Cell(VarCell),
    /// In-flight error; redirects control to the current error handler
    Error(Arc<ErrorValue>),
    /// Caught error, an ordinary value
    Exception(Arc<ErrorValue>),
    /// Host function
    Native(NativeFn),
    /// Externally defined heap value
    Object(Arc<dyn Object>),
}

struct NilOps;
struct BoolOps;
struct IntOps;
struct RealOps;
struct StrOps;
struct TupleOps;
struct CellOps;
struct ErrorOps;
struct ExceptionOps;
struct NativeOps;

impl TypeOps for NilOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Nil
    }

    fn hash(&self, _this: &Value) -> u64 {
        mix64(0)
    }
}

impl TypeOps for BoolOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Bool
    }

    fn hash(&self, this: &Value) -> u64 {
        match this {
            Value::Bool(b) => mix64(u64::from(*b) + 1),
            _ => 0,
        }
    }
}

impl TypeOps for IntOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Int
    }

    fn hash(&self, this: &Value) -> u64 {
        match this {
            Value::Int(n) => mix64(*n as u64),
            _ => 0,
        }
    }
}

impl TypeOps for RealOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Real
    }

    fn hash(&self, this: &Value) -> u64 {
        match this {
            Value::Real(n) => mix64(n.to_bits()),
            _ => 0,
        }
    }
}

impl TypeOps for StrOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Str
    }

    fn hash(&self, this: &Value) -> u64 {
        match this {
            Value::Str(s) => fnv1a(s.as_bytes()),
            _ => 0,
        }
    }
}

impl TypeOps for TupleOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Tuple
    }

    fn hash(&self, this: &Value) -> u64 {
        match this {
            Value::Tuple(items) => items
                .iter()
                .fold(mix64(items.len() as u64), |acc, item| {
                    mix64(acc ^ item.hash_code())
                }),
            _ => 0,
        }
    }
}

impl TypeOps for CellOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Cell
    }

    fn hash(&self, this: &Value) -> u64 {
        match this {
            Value::Cell(cell) => address_hash(cell.as_ptr()),
            _ => 0,
        }
    }

    fn dereference(&self, this: &Value) -> Value {
        match this {
            Value::Cell(cell) => cell.get(),
            other => other.clone(),
        }
    }

    fn assign(&self, this: &Value, value: Value) -> Value {
        match this {
            Value::Cell(cell) => {
                cell.set(value.clone());
                value
            }
            _ => Value::error(kinds::TYPE_ERROR, "cell descriptor used on a non-cell"),
        }
    }
}

impl TypeOps for ErrorOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Error
    }

    fn hash(&self, this: &Value) -> u64 {
        match this {
            Value::Error(err) => address_hash(Arc::as_ptr(err)),
            _ => 0,
        }
    }
}

impl TypeOps for ExceptionOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Exception
    }

    fn hash(&self, this: &Value) -> u64 {
        match this {
            Value::Exception(err) => address_hash(Arc::as_ptr(err)),
            _ => 0,
        }
    }
}

impl TypeOps for NativeOps {
    fn tag(&self) -> TypeTag {
        TypeTag::Native
    }

    fn hash(&self, this: &Value) -> u64 {
        match this {
            Value::Native(native) => address_hash(native.as_ptr()),
            _ => 0,
        }
    }

    fn call(&self, this: &Value, args: &[Value]) -> Value {
        match this {
            Value::Native(native) => native.invoke(args),
            _ => Value::error(kinds::TYPE_ERROR, "native descriptor used on a non-native"),
        }
    }
}

impl Value {
    /// Selects this value's dispatch table.
    pub fn ops(&self) -> &dyn TypeOps {
        match self {
            Value::Nil => &NilOps,
            Value::Bool(_) => &BoolOps,
            Value::Int(_) => &IntOps,
            Value::Real(_) => &RealOps,
            Value::Str(_) => &StrOps,
            Value::Tuple(_) => &TupleOps,
            Value::Cell(_) => &CellOps,
            Value::Error(_) => &ErrorOps,
            Value::Exception(_) => &ExceptionOps,
            Value::Native(_) => &NativeOps,
            Value::Object(obj) => obj.type_ops(),
        }
    }

    /// Most-derived type tag.
    pub fn type_tag(&self) -> TypeTag {
        self.ops().tag()
    }

    /// Hash through the dispatch table.
    pub fn hash_code(&self) -> u64 {
        self.ops().hash(self)
    }

    /// Calls through the dispatch table.
    pub fn call(&self, args: &[Value]) -> Value {
        self.ops().call(self, args)
    }

    /// Dereferences through the dispatch table.
    pub fn dereference(&self) -> Value {
        self.ops().dereference(self)
    }

    /// Assigns through the dispatch table.
    pub fn assign(&self, value: Value) -> Value {
        self.ops().assign(self, value)
    }

    /// Builds a string value.
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    /// Builds a tuple value.
    pub fn tuple(items: impl Into<Arc<[Value]>>) -> Value {
        Value::Tuple(items.into())
    }

    /// Builds an in-flight error value.
    pub fn error(kind: &str, message: impl Into<String>) -> Value {
        Value::Error(Arc::new(ErrorValue::new(kind, message)))
    }

    /// Builds a host function value.
    pub fn native<F>(name: &str, func: F) -> Value
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Value::Native(NativeFn::new(name, func))
    }

    /// Wraps a host object.
    pub fn object<T: Object + 'static>(obj: T) -> Value {
        Value::Object(Arc::new(obj))
    }

    /// Returns true for the nil sentinel.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns true for in-flight errors.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Float payload, if any.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(n) => Some(*n),
            _ => None,
        }
    }

    /// String payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Tuple elements, if any.
    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Error payload of an in-flight error or a caught exception.
    pub fn as_error(&self) -> Option<&Arc<ErrorValue>> {
        match self {
            Value::Error(err) | Value::Exception(err) => Some(err),
            _ => None,
        }
    }

    /// Borrows a host object as its concrete type.
    pub fn downcast_ref<T: Object + 'static>(&self) -> Option<&T> {
        match self {
            Value::Object(obj) => AsAny::as_any(&**obj).downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Clones a host object handle as its concrete type.
    pub fn downcast_arc<T: Object + 'static>(&self) -> Option<Arc<T>> {
        match self {
            Value::Object(obj) => AsAny::into_any_arc(Arc::clone(obj)).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Cell(a), Value::Cell(b)) => a.ptr_eq(b),
            (Value::Error(a), Value::Error(b)) => Arc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Real(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Real(n) => write!(f, "{:?}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Cell(cell) => write!(f, "<cell {}>", cell.get()),
            Value::Error(err) => write!(f, "<error {}: {}>", err.kind(), err.message()),
            Value::Exception(err) => {
                write!(f, "<exception {}: {}>", err.kind(), err.message())
            }
            Value::Native(native) => write!(f, "<native {}>", native.name()),
            Value::Object(obj) => write!(f, "{}", obj.describe()),
        }
    }
}
