use std::fmt;

use crate::signature::{Signature, SignatureBuf};

/// A dynamically typed D-Bus value.
///
/// Message bodies are sequences of values whose shape is described by a
/// [`Signature`]. Unix file descriptors are not supported.
///
/// # Examples
///
/// ```
/// use wirebus::Value;
///
/// let v = Value::from("hello");
/// assert_eq!(v.as_str(), Some("hello"));
/// assert_eq!(v.signature().as_str(), "s");
/// ```
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// An 8-bit unsigned integer, type code `y`.
    Byte(u8),
    /// A boolean, type code `b`.
    Bool(bool),
    /// A 16-bit signed integer, type code `n`.
    Int16(i16),
    /// A 16-bit unsigned integer, type code `q`.
    Uint16(u16),
    /// A 32-bit signed integer, type code `i`.
    Int32(i32),
    /// A 32-bit unsigned integer, type code `u`.
    Uint32(u32),
    /// A 64-bit signed integer, type code `x`.
    Int64(i64),
    /// A 64-bit unsigned integer, type code `t`.
    Uint64(u64),
    /// An IEEE 754 double, type code `d`.
    Double(f64),
    /// A string, type code `s`.
    String(String),
    /// An object path, type code `o`.
    ObjectPath(String),
    /// A signature, type code `g`.
    Signature(SignatureBuf),
    /// An array of values sharing an element signature, type code `a`.
    Array(Array),
    /// A struct, type codes `(`..`)`.
    Struct(Vec<Value>),
    /// A variant carrying a single value alongside its signature.
    Variant(Box<Value>),
    /// A dict entry, type codes `{`..`}`. Only valid as an array element.
    DictEntry(Box<Value>, Box<Value>),
}

impl Value {
    /// The signature describing this value.
    pub fn signature(&self) -> SignatureBuf {
        let mut out = String::new();
        self.write_signature(&mut out);
        SignatureBuf::from_string_unchecked(out)
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Value::Byte(..) => out.push('y'),
            Value::Bool(..) => out.push('b'),
            Value::Int16(..) => out.push('n'),
            Value::Uint16(..) => out.push('q'),
            Value::Int32(..) => out.push('i'),
            Value::Uint32(..) => out.push('u'),
            Value::Int64(..) => out.push('x'),
            Value::Uint64(..) => out.push('t'),
            Value::Double(..) => out.push('d'),
            Value::String(..) => out.push('s'),
            Value::ObjectPath(..) => out.push('o'),
            Value::Signature(..) => out.push('g'),
            Value::Array(array) => {
                out.push('a');
                out.push_str(array.element().as_str());
            }
            Value::Struct(fields) => {
                out.push('(');

                for field in fields {
                    field.write_signature(out);
                }

                out.push(')');
            }
            Value::Variant(..) => out.push('v'),
            Value::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
        }
    }

    /// A short name of the value's kind, for diagnostics.
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Value::Byte(..) => "byte",
            Value::Bool(..) => "bool",
            Value::Int16(..) => "int16",
            Value::Uint16(..) => "uint16",
            Value::Int32(..) => "int32",
            Value::Uint32(..) => "uint32",
            Value::Int64(..) => "int64",
            Value::Uint64(..) => "uint64",
            Value::Double(..) => "double",
            Value::String(..) => "string",
            Value::ObjectPath(..) => "object path",
            Value::Signature(..) => "signature",
            Value::Array(..) => "array",
            Value::Struct(..) => "struct",
            Value::Variant(..) => "variant",
            Value::DictEntry(..) => "dict entry",
        }
    }

    /// Coerce into a string slice, for [`Value::String`] and
    /// [`Value::ObjectPath`] values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce into a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Coerce into a `u32`.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(n) => Some(*n),
            _ => None,
        }
    }

    /// Coerce into an `i32`.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(n) => Some(*n),
            _ => None,
        }
    }

    /// Coerce into a `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint64(n) => Some(*n),
            _ => None,
        }
    }

    /// Coerce into an `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    /// Coerce into an array.
    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    /// Coerce into struct fields.
    pub fn as_struct(&self) -> Option<&[Value]> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// The value inside of a variant.
    pub fn as_variant(&self) -> Option<&Value> {
        match self {
            Value::Variant(value) => Some(value),
            _ => None,
        }
    }
}

macro_rules! from_impl {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                #[inline]
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    }
}

from_impl! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f64 => Double,
    String => String,
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<Array> for Value {
    #[inline]
    fn from(value: Array) -> Self {
        Value::Array(value)
    }
}

/// An array of values which share an element signature.
///
/// The element signature is carried separately so that empty arrays remain
/// fully typed.
///
/// # Examples
///
/// ```
/// use wirebus::{Array, Signature, Value};
///
/// let mut array = Array::new(Signature::new("s")?);
/// array.push(Value::from("hello"));
/// assert_eq!(array.len(), 1);
/// assert_eq!(Value::from(array).signature().as_str(), "as");
/// # Ok::<_, wirebus::SignatureError>(())
/// ```
#[derive(Clone, PartialEq)]
pub struct Array {
    element: SignatureBuf,
    values: Vec<Value>,
}

impl Array {
    /// Construct a new empty array with the given element signature.
    pub fn new(element: &Signature) -> Array {
        Self {
            element: element.to_owned(),
            values: Vec::new(),
        }
    }

    /// Construct an array from an element signature and values.
    ///
    /// The values are not checked against the signature here; encoding
    /// performs that check.
    pub fn from_values(element: &Signature, values: Vec<Value>) -> Array {
        Self {
            element: element.to_owned(),
            values,
        }
    }

    /// The signature of each element.
    pub fn element(&self) -> &Signature {
        &self.element
    }

    /// Push a value onto the array.
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// The values of the array.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Convert the array into its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// The number of elements in the array.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Test if the array is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the values of the array.
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.values).finish()
    }
}

impl<'a> IntoIterator for &'a Array {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Signature;

    #[test]
    fn value_signatures() {
        assert_eq!(Value::from(10u8).signature().as_str(), "y");
        assert_eq!(Value::from("hi").signature().as_str(), "s");

        let v = Value::Struct(vec![
            Value::from(1i32),
            Value::Variant(Box::new(Value::from("x"))),
        ]);
        assert_eq!(v.signature().as_str(), "(iv)");

        let mut dict = Array::new(Signature::new("{sv}").unwrap());
        dict.push(Value::DictEntry(
            Box::new(Value::from("key")),
            Box::new(Value::Variant(Box::new(Value::from(1u32)))),
        ));
        assert_eq!(Value::from(dict).signature().as_str(), "a{sv}");
    }

    #[test]
    fn empty_array_keeps_element_signature() {
        let array = Array::new(Signature::new("ai").unwrap());
        assert!(array.is_empty());
        assert_eq!(Value::from(array).signature().as_str(), "aai");
    }
}
