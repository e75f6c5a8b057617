//! Dynamic payload values.
//!
//! Payloads are heterogeneous documents: the usual scalar kinds plus binary
//! blobs, multi-dimensional numeric arrays, and encoded images. Maps preserve
//! insertion order so a decode/re-encode cycle is byte-identical.

use bytes::Bytes;

/// Element type of an [`Ndarray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn item_size(self) -> usize {
        match self {
            Dtype::I8 | Dtype::U8 | Dtype::Bool => 1,
            Dtype::F16 | Dtype::I16 | Dtype::U16 => 2,
            Dtype::F32 | Dtype::I32 | Dtype::U32 => 4,
            Dtype::F64 | Dtype::I64 | Dtype::U64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::F16 => "f16",
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
            Dtype::I8 => "i8",
            Dtype::I16 => "i16",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
            Dtype::U8 => "u8",
            Dtype::U16 => "u16",
            Dtype::U32 => "u32",
            Dtype::U64 => "u64",
            Dtype::Bool => "bool",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "f16" => Dtype::F16,
            "f32" => Dtype::F32,
            "f64" => Dtype::F64,
            "i8" => Dtype::I8,
            "i16" => Dtype::I16,
            "i32" => Dtype::I32,
            "i64" => Dtype::I64,
            "u8" => Dtype::U8,
            "u16" => Dtype::U16,
            "u32" => Dtype::U32,
            "u64" => Dtype::U64,
            "bool" => Dtype::Bool,
            _ => return None,
        })
    }
}

/// Row-major n-dimensional array extension.
#[derive(Debug, Clone, PartialEq)]
pub struct Ndarray {
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    pub data: Bytes,
}

impl Ndarray {
    pub fn new(dtype: Dtype, shape: Vec<u64>, data: impl Into<Bytes>) -> Self {
        Self {
            dtype,
            shape,
            data: data.into(),
        }
    }

    /// Number of elements implied by the shape.
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Whether `data` length matches `shape` x `dtype`.
    pub fn is_consistent(&self) -> bool {
        self.element_count()
            .checked_mul(self.dtype.item_size() as u64)
            .map(|n| n == self.data.len() as u64)
            .unwrap_or(false)
    }
}

/// Encoded image extension (`png`, `jpeg`, ...). The payload is the encoded
/// file body, not raw pixels; `shape` is advisory.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub format: String,
    pub shape: Option<Vec<u64>>,
    pub data: Bytes,
}

/// A self-describing payload value.
///
/// `Map` is a `Vec` of pairs rather than a hash map: one encode must preserve
/// the key order it observed at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
    Ndarray(Ndarray),
    Image(Image),
}

impl Value {
    /// Build a map value from pairs, preserving order.
    pub fn map<K: Into<String>, V: Into<Value>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// First value under `key`, for map values.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Ndarray> for Value {
    fn from(v: Ndarray) -> Self {
        Value::Ndarray(v)
    }
}

impl From<Image> for Value {
    fn from(v: Image) -> Self {
        Value::Image(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_lookup_preserves_first_match() {
        let v = Value::map([("a", Value::Int(1)), ("b", Value::Int(2))]);
        assert_eq!(v.get("b").and_then(Value::as_int), Some(2));
        assert!(v.get("c").is_none());
    }

    #[test]
    fn ndarray_consistency() {
        let arr = Ndarray::new(Dtype::F32, vec![2, 3], vec![0u8; 24]);
        assert!(arr.is_consistent());
        let bad = Ndarray::new(Dtype::F32, vec![2, 3], vec![0u8; 23]);
        assert!(!bad.is_consistent());
    }

    #[test]
    fn dtype_names_round_trip() {
        for d in [
            Dtype::F16,
            Dtype::F32,
            Dtype::F64,
            Dtype::I8,
            Dtype::I16,
            Dtype::I32,
            Dtype::I64,
            Dtype::U8,
            Dtype::U16,
            Dtype::U32,
            Dtype::U64,
            Dtype::Bool,
        ] {
            assert_eq!(Dtype::from_str(d.as_str()), Some(d));
        }
    }
}
