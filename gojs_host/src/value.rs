use crate::*;
use fxhash::*;
use std::sync::*;

/// A plain, dictionary-like object.
pub type Record = FxHashMap<String, Value>;

/// A host-resident value that the guest can refer to.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// The absence of a value. Encoded as a zero float and never given a table slot.
    #[default]
    Undefined,
    /// The null object.
    Null,
    /// A boolean.
    Bool(bool),
    /// A double-precision number.
    Number(f64),
    /// An immutable string, compared by contents.
    String(Arc<str>),
    /// A mutable byte buffer.
    Bytes(Shared<Vec<u8>>),
    /// A mutable ordered sequence.
    Array(Shared<Vec<Value>>),
    /// A mutable key-value object.
    Object(Shared<Record>),
    /// One of the fixed environment stand-ins.
    Host(HostObject),
    /// Something that may be called.
    Function(Function)
}

impl Value {
    /// Creates a string value.
    pub fn string(value: impl Into<Arc<str>>) -> Self {
        Self::String(value.into())
    }

    /// Creates a byte buffer value.
    pub fn bytes(value: Vec<u8>) -> Self {
        Self::Bytes(Shared::new(value))
    }

    /// Creates an array value.
    pub fn array(value: Vec<Value>) -> Self {
        Self::Array(Shared::new(value))
    }

    /// Creates an object with the given fields.
    pub fn object(fields: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        Self::Object(Shared::new(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()))
    }

    /// Creates an error object in the shape the guest's syscall layer inspects.
    pub fn error(code: &str, message: impl std::fmt::Display) -> Self {
        Self::object([
            ("code", Self::string(code)),
            ("message", Self::string(message.to_string()))
        ])
    }

    /// The tag stored in the upper word of a boxed reference.
    pub fn type_flag(&self) -> u32 {
        match self {
            Self::Undefined | Self::Null | Self::Bool(_) | Self::Number(_) => 0,
            Self::String(_) => 2,
            Self::Function(_) => 4,
            Self::Bytes(_) | Self::Array(_) | Self::Object(_) | Self::Host(_) => 1
        }
    }

    /// The identity under which this value is canonicalized, if any.
    /// Arrays are captured per call and always receive a fresh slot.
    pub fn key(&self) -> Option<ValueKey> {
        match self {
            Self::Undefined | Self::Array(_) => None,
            Self::Null => Some(ValueKey::Null),
            Self::Bool(x) => Some(ValueKey::Bool(*x)),
            Self::Number(x) if *x == 0.0 => Some(ValueKey::Number(0f64.to_bits())),
            Self::Number(x) => Some(ValueKey::Number(x.to_bits())),
            Self::String(x) => Some(ValueKey::String(x.clone())),
            Self::Bytes(x) => Some(ValueKey::Reference(x.addr())),
            Self::Object(x) => Some(ValueKey::Reference(x.addr())),
            Self::Host(x) => Some(ValueKey::Host(*x)),
            Self::Function(x) => Some(ValueKey::Function(*x))
        }
    }

    /// Whether this value is null or undefined.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// Interprets this value as a number, if it is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(x) => Some(*x),
            _ => None
        }
    }

    /// Interprets this value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(x) => Some(x),
            _ => None
        }
    }

    /// The length of an ordered or byte sequence. Strings report UTF-16 code units.
    pub fn length(&self) -> Option<usize> {
        match self {
            Self::String(x) => Some(x.encode_utf16().count()),
            Self::Bytes(x) => Some(x.lock().len()),
            Self::Array(x) => Some(x.lock().len()),
            _ => None
        }
    }

    /// Reads a field of a plain object, yielding undefined when absent.
    pub fn field(&self, name: &str) -> Value {
        match self {
            Self::Object(x) => x.lock().get(name).cloned().unwrap_or_default(),
            _ => Value::Undefined
        }
    }

    /// Converts this value to its string form, the way string coercion does in the guest's source language.
    pub fn to_js_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(x) => x.to_string(),
            Self::Number(x) => format_number(*x),
            Self::String(x) => x.to_string(),
            Self::Bytes(x) => x.lock().iter().map(u8::to_string).collect::<Vec<_>>().join(","),
            Self::Array(x) => x.lock().iter()
                .map(|x| if x.is_nullish() { String::new() } else { x.to_js_string() })
                .collect::<Vec<_>>()
                .join(","),
            Self::Object(_) | Self::Host(_) => "[object Object]".to_string(),
            Self::Function(_) => "function () { [native code] }".to_string()
        }
    }

    /// A short human-readable form for diagnostics. Error objects show their message.
    pub fn describe(&self) -> String {
        match self {
            Self::Object(x) => match x.lock().get("message") {
                Some(message) => message.to_js_string(),
                None => self.to_js_string()
            },
            _ => self.to_js_string()
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a.ptr_eq(b),
            (Self::Array(a), Self::Array(b)) => a.ptr_eq(b),
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            (Self::Host(a), Self::Host(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a == b,
            _ => false
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::string(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A mutable value that every copy refers to, compared by identity.
#[derive(Debug)]
pub struct Shared<T>(Arc<Mutex<T>>);

impl<T> Shared<T> {
    /// Wraps `value`.
    pub fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    /// Locks the value. A panic while it was held does not make it unusable.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles refer to the same value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The address that identifies the value.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Identity of a canonicalized value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Null,
    Bool(bool),
    Number(u64),
    String(Arc<str>),
    Reference(usize),
    Host(HostObject),
    Function(Function)
}

/// A callable value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Function {
    /// Implemented by the host.
    Native(NativeFn),
    /// A guest function wrapper, identified by the guest's own callback id.
    Guest(u32)
}

/// The host-implemented callables reachable from the object graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NativeFn {
    ObjectConstructor,
    ArrayConstructor,
    Uint8ArrayConstructor,
    FsWriteSync,
    FsWrite,
    ProcessId,
    MakeFuncWrapper,
    /// A known name the environment deliberately does not support.
    Unsupported(&'static str)
}

/// Formats a number the way the guest's source language prints it.
fn format_number(x: f64) -> String {
    if x.is_nan() {
        "NaN".to_string()
    }
    else if x.is_infinite() {
        String::from(if x > 0.0 { "Infinity" } else { "-Infinity" })
    }
    else if x == 0.0 {
        "0".to_string()
    }
    else if x.fract() == 0.0 && x.abs() < 1e21 {
        format!("{x:.0}")
    }
    else {
        format!("{x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_format_without_trailing_fraction() {
        assert_eq!(Value::Number(42.0).to_js_string(), "42");
        assert_eq!(Value::Number(-0.0).to_js_string(), "0");
        assert_eq!(Value::Number(1.5).to_js_string(), "1.5");
        assert_eq!(Value::Number(f64::NAN).to_js_string(), "NaN");
        assert_eq!(Value::Number(f64::NEG_INFINITY).to_js_string(), "-Infinity");
    }

    #[test]
    fn arrays_join_elements_and_blank_nullish() {
        let value = Value::array(vec![Value::Number(1.0), Value::Null, Value::from("x")]);
        assert_eq!(value.to_js_string(), "1,,x");
    }

    #[test]
    fn strings_compare_by_contents_and_objects_by_identity() {
        assert_eq!(Value::from("abc"), Value::string(String::from("abc")));
        assert_eq!(Value::from("abc").key(), Value::from("abc").key());

        let a = Value::object([]);
        let b = Value::object([]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn zero_keys_ignore_sign() {
        assert_eq!(Value::Number(0.0).key(), Value::Number(-0.0).key());
    }

    #[test]
    fn arrays_are_never_canonicalized() {
        assert_eq!(Value::array(Vec::new()).key(), None);
        assert_eq!(Value::Undefined.key(), None);
    }

    #[test]
    fn type_flags_follow_the_boxing_convention() {
        assert_eq!(Value::Null.type_flag(), 0);
        assert_eq!(Value::Bool(true).type_flag(), 0);
        assert_eq!(Value::object([]).type_flag(), 1);
        assert_eq!(Value::Host(HostObject::Global).type_flag(), 1);
        assert_eq!(Value::from("s").type_flag(), 2);
        assert_eq!(Value::Function(Function::Guest(3)).type_flag(), 4);
    }

    #[test]
    fn error_objects_describe_their_message() {
        let error = Value::error("ENOSYS", "function not implemented");
        assert_eq!(error.field("code"), Value::from("ENOSYS"));
        assert_eq!(error.describe(), "function not implemented");
    }

    #[test]
    fn string_length_counts_utf16_units() {
        assert_eq!(Value::from("h\u{e9}\u{1f600}").length(), Some(4));
        assert_eq!(Value::Null.length(), None);
    }
}
