//! The typed object graph carried by keyed archives.

use std::collections::BTreeMap;
use std::fmt;

/// String-keyed mapping. Keys are unique; encode order is irrelevant.
pub type Dict = BTreeMap<String, Value>;

/// Archiver class metadata: a class name plus its hierarchy, e.g.
/// `NSMutableDictionary` with `["NSMutableDictionary", "NSDictionary", "NSObject"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub name: String,
    pub hierarchy: Vec<String>,
}

impl ClassInfo {
    pub fn new(name: impl Into<String>, hierarchy: &[&str]) -> Self {
        Self {
            name: name.into(),
            hierarchy: hierarchy.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A value wrapped with an explicit archiver class.
///
/// The class is consulted only at encode time; decoding never produces this
/// variant and equality looks straight through it.
#[derive(Debug, Clone)]
pub struct Classed {
    pub class: ClassInfo,
    pub value: Value,
}

/// A keyed-archive value: the variant set the wire format can carry.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Data(Vec<u8>),
    /// Ordered sequence (`NSArray` by default).
    Array(Vec<Value>),
    /// Unordered collection (`NSSet` by default). Element order is whatever
    /// the encoder or peer produced.
    Set(Vec<Value>),
    Dict(Dict),
    /// A value carrying an explicit encode-time class.
    Classed(Box<Classed>),
}

impl Value {
    /// Wrap this value with an explicit archiver class.
    pub fn with_class(self, name: impl Into<String>, hierarchy: &[&str]) -> Value {
        Value::Classed(Box::new(Classed {
            class: ClassInfo::new(name, hierarchy),
            value: self,
        }))
    }

    /// Strip any class wrapper and return the underlying value.
    pub fn unclassed(&self) -> &Value {
        let mut v = self;
        while let Value::Classed(c) = v {
            v = &c.value;
        }
        v
    }

    pub fn is_null(&self) -> bool {
        matches!(self.unclassed(), Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unclassed() {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self.unclassed() {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self.unclassed() {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self.unclassed() {
            Value::Array(a) | Value::Set(a) => Some(a),
            _ => None,
        }
    }

    /// Best-effort numeric view, mirroring how peers treat `NSNumber`s.
    pub fn as_f64(&self) -> Option<f64> {
        match *self.unclassed() {
            Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
            Value::I32(v) => Some(v as f64),
            Value::I64(v) => Some(v as f64),
            Value::U64(v) => Some(v as f64),
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => None,
        }
    }
}

/// Equality is by shape: class wrappers are transparent, containers compare
/// element-wise, and numeric leaves compare by value across widths (the
/// wire does not preserve integer or float width, so `I32(1)`, `I64(1)`
/// and `U64(1)` are the same value).
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        let (a, b) = (self.unclassed(), other.unclassed());
        if let (Some(x), Some(y)) = (integer_of(a), integer_of(b)) {
            return x == y;
        }
        if let (Some(x), Some(y)) = (float_of(a), float_of(b)) {
            return x == y;
        }
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Data(a), Value::Data(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            _ => false,
        }
    }
}

fn integer_of(v: &Value) -> Option<i128> {
    match *v {
        Value::I32(x) => Some(i128::from(x)),
        Value::I64(x) => Some(i128::from(x)),
        Value::U64(x) => Some(i128::from(x)),
        _ => None,
    }
}

fn float_of(v: &Value) -> Option<f64> {
    match *v {
        Value::F32(x) => Some(f64::from(x)),
        Value::F64(x) => Some(x),
        _ => None,
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Data(v)
    }
}

/// Compact JSON-like rendering, used when dumping messages.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unclassed() {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Data(d) => write!(f, "<{} bytes>", d.len()),
            Value::Array(items) | Value::Set(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Classed(_) => unreachable!("unclassed strips wrappers"),
        }
    }
}
