//! Host-side value model for the WASM boundary.
//!
//! `Value` is the closed set of shapes that can cross between the host and a
//! wrapped module: scalars, strings, byte buffers, u64 arrays, nested
//! arrays/records, opaque extern references, and function references into the
//! guest's table.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An opaque host value passed across the boundary by reference.
///
/// Extern values are compared by identity (`Arc::ptr_eq`), never by content.
pub type ExternVal = Arc<dyn Any + Send + Sync>;

/// A reference to an entry in the guest's exported function table.
///
/// Invoking it goes through [`WrappedModule::call_function`]; each invocation
/// runs its own independent lower/call/lift/reset cycle.
///
/// [`WrappedModule::call_function`]: crate::wrapper::WrappedModule::call_function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncRef {
    /// Index into the guest's exported function table.
    pub index: u32,
}

impl FuncRef {
    /// Create a function reference from a table index.
    pub const fn new(index: u32) -> Self {
        Self { index }
    }
}

/// A host value that can be lowered into or lifted out of a wrapped module.
#[derive(Clone)]
pub enum Value {
    /// Absent value (lowered as 0 for integer params, NaN for float params).
    Null,
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit float.
    Float(f64),
    /// Boolean. Liftable, but not lowerable as an argument.
    Bool(bool),
    /// Raw byte buffer, copied across the boundary.
    Bytes(Vec<u8>),
    /// UTF-8 string.
    Str(String),
    /// Unsigned 64-bit element array.
    U64Array(Vec<u64>),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Key/value record; insertion order preserved, keys unique.
    Object(Vec<(String, Value)>),
    /// Opaque host value, held in the extern table by identity.
    Extern(ExternVal),
    /// First-class function reference into the guest table.
    Function(FuncRef),
}

impl Value {
    /// Create a string value.
    pub fn string(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// Create an extern value from any host object.
    pub fn extern_val<T: Any + Send + Sync>(v: T) -> Self {
        Self::Extern(Arc::new(v))
    }

    /// Check if the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get as i32 if the value is an integer.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if the value is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(f64::from(*i)),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as bool if the value is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as a string slice if the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get as a byte slice if the value is a byte buffer.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as an array slice if the value is an array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Get the extern payload if the value is an extern reference.
    pub fn as_extern(&self) -> Option<&ExternVal> {
        match self {
            Self::Extern(v) => Some(v),
            _ => None,
        }
    }

    /// Look up an object field by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Name of the value's shape, used in error reporting.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Bytes(_) => "bytes",
            Self::Str(_) => "string",
            Self::U64Array(_) => "u64array",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Extern(_) => "extern",
            Self::Function(_) => "function",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::U64Array(a), Self::U64Array(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            // identity, not content
            (Self::Extern(a), Self::Extern(b)) => Arc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(v) => write!(f, "Float({v})"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::U64Array(v) => write!(f, "U64Array(len={})", v.len()),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Object(pairs) => f.debug_tuple("Object").field(pairs).finish(),
            Self::Extern(v) => write!(f, "Extern({:p})", Arc::as_ptr(v)),
            Self::Function(r) => write!(f, "Function(index={})", r.index),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Str(s) => write!(f, "{s}"),
            Self::U64Array(v) => write!(f, "<{} u64 elements>", v.len()),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Object(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Extern(_) => write!(f, "<extern>"),
            Self::Function(r) => write!(f, "<function #{}>", r.index),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl From<Vec<u64>> for Value {
    fn from(v: Vec<u64>) -> Self {
        Self::U64Array(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        assert_eq!(Value::Int(7).as_i32(), Some(7));
        assert_eq!(Value::Int(7).as_f64(), Some(7.0));
        assert_eq!(Value::Float(0.5).as_f64(), Some(0.5));
        assert_eq!(Value::string("hi").as_str(), Some("hi"));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
    }

    #[test]
    fn object_field_lookup() {
        let obj = Value::Object(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::string("x")),
        ]);
        assert_eq!(obj.get("a"), Some(&Value::Int(1)));
        assert_eq!(obj.get("b").and_then(|v| v.as_str()), Some("x"));
        assert!(obj.get("c").is_none());
    }

    #[test]
    fn extern_equality_is_identity() {
        let a: ExternVal = Arc::new("payload".to_string());
        let v1 = Value::Extern(Arc::clone(&a));
        let v2 = Value::Extern(Arc::clone(&a));
        let v3 = Value::extern_val("payload".to_string());

        assert_eq!(v1, v2);
        // same content, different allocation
        assert_ne!(v1, v3);
    }

    #[test]
    fn from_impls() {
        assert_eq!(Value::from(3), Value::Int(3));
        assert_eq!(Value::from("s"), Value::Str("s".to_string()));
        assert_eq!(Value::from(vec![1u8, 2]), Value::Bytes(vec![1, 2]));
        assert_eq!(
            Value::from(vec![Value::Int(1)]),
            Value::Array(vec![Value::Int(1)])
        );
    }
}
