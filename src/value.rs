//! The closed set of value kinds that may cross between namespaces.
//!
//! Script values are snapshotted into [`Value`] and rebuilt from it, so a
//! value on one side of the bridge never shares storage with the other side.
//! Anything outside this set (engine handles, accumulator objects, foreign
//! custom types) is rejected instead of being copied.

mod array;
mod callable;

pub use array::{format_shape, scalar_of, ArrayData, Complex, DType, NdArray};
pub use callable::{Callable, FunctionLib};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rhai::{Dynamic, EvalAltResult, FnPtr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("a value of kind '{0}', which cannot be transferred")]
    Unsupported(String),

    #[error("nested lists do not form a regular array")]
    Ragged,

    #[error("array elements must be numbers, found '{0}'")]
    NotNumeric(&'static str),

    #[error("cannot store a '{found}' in a {expected} array")]
    ElementKind {
        expected: &'static str,
        found: &'static str,
    },

    #[error("index {index} is out of bounds for an array of {len} elements")]
    OutOfBounds { index: usize, len: usize },

    #[error("an array of shape {0}, which is too large")]
    TooLarge(String),

    #[error("a value nested more than {0} levels deep")]
    TooDeep(usize),
}

/// Deepest list/map nesting a snapshot accepts
pub const MAX_DEPTH: usize = 64;

/// Snapshot of a script value.
///
/// Lists and maps are at most [`MAX_DEPTH`] levels deep, so walking,
/// cloning or dropping a snapshot never needs more than a bounded stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(Complex),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
    Array(NdArray),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Function(Callable),
}

impl Value {
    /// Snapshot of a script value, without support for function pointers
    pub fn from_dynamic(value: &Dynamic) -> Result<Self, ValueError> {
        Self::capture(value, None)
    }

    /// Snapshot of a script value; function pointers are resolved against
    /// `lib`, the library of the code that produced them.
    pub fn capture(value: &Dynamic, lib: Option<&Arc<FunctionLib>>) -> Result<Self, ValueError> {
        Self::capture_at(value, lib, 0)
    }

    fn capture_at(value: &Dynamic, lib: Option<&Arc<FunctionLib>>, depth: usize) -> Result<Self, ValueError> {
        let unsupported = || ValueError::Unsupported(value.type_name().to_string());

        // Containers are read in place; cloning them first would copy the
        // whole tree before the depth bound is checked.
        if value.is_array() || value.is_map() {
            if depth >= MAX_DEPTH {
                return Err(ValueError::TooDeep(MAX_DEPTH));
            }
            if let Some(items) = value.read_lock::<rhai::Array>() {
                return items
                    .iter()
                    .map(|item| Self::capture_at(item, lib, depth + 1))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::List);
            }
            let map = value.read_lock::<rhai::Map>().ok_or_else(unsupported)?;
            return map
                .iter()
                .map(|(k, v)| Ok((k.to_string(), Self::capture_at(v, lib, depth + 1)?)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Self::Map);
        }

        let value = value.flatten_clone();

        if value.is_unit() {
            return Ok(Self::Null);
        }
        if let Ok(b) = value.as_bool() {
            return Ok(Self::Bool(b));
        }
        if let Ok(i) = value.as_int() {
            return Ok(Self::Int(i));
        }
        if let Ok(f) = value.as_float() {
            return Ok(Self::Float(f));
        }
        if let Ok(c) = value.as_char() {
            return Ok(Self::Char(c));
        }
        if value.is_string() {
            return value.into_string().map(Self::Str).map_err(|_| unsupported());
        }
        if value.is_blob() {
            return value.into_blob().map(Self::Bytes).map_err(|_| unsupported());
        }
        if value.is::<NdArray>() {
            return value.clone().try_cast::<NdArray>().map(Self::Array).ok_or_else(unsupported);
        }
        if value.is::<Complex>() {
            return value.clone().try_cast::<Complex>().map(Self::Complex).ok_or_else(unsupported);
        }
        if value.is::<Callable>() {
            return value.clone().try_cast::<Callable>().map(Self::Function).ok_or_else(unsupported);
        }
        if value.is_fnptr() {
            let (Some(fn_ptr), Some(lib)) = (value.clone().try_cast::<FnPtr>(), lib) else {
                return Err(unsupported());
            };
            if !lib.defines(fn_ptr.fn_name()) {
                return Err(unsupported());
            }
            let curry = fn_ptr
                .curry()
                .iter()
                .map(|arg| Self::capture_at(arg, Some(lib), depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::Function(Callable::new(
                fn_ptr.fn_name(),
                curry,
                Arc::clone(lib),
            )));
        }

        Err(unsupported())
    }

    /// Rebuilds a fresh script value
    pub fn into_dynamic(self) -> Dynamic {
        match self {
            Self::Null => Dynamic::UNIT,
            Self::Bool(b) => Dynamic::from(b),
            Self::Int(i) => Dynamic::from(i),
            Self::Float(f) => Dynamic::from(f),
            Self::Complex(c) => Dynamic::from(c),
            Self::Char(c) => Dynamic::from_char(c),
            Self::Str(s) => Dynamic::from(s),
            Self::Bytes(b) => Dynamic::from_blob(b),
            Self::Array(a) => Dynamic::from(a),
            Self::List(items) => {
                Dynamic::from_array(items.into_iter().map(Self::into_dynamic).collect())
            }
            Self::Map(map) => Dynamic::from_map(
                map.into_iter()
                    .map(|(k, v)| (k.into(), v.into_dynamic()))
                    .collect::<rhai::Map>(),
            ),
            Self::Function(f) => Dynamic::from(f),
        }
    }

    /// Kind name used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Complex(_) => "complex",
            Self::Char(_) => "char",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Function(_) => "function",
        }
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind() == kind
    }
}

pub const KINDS: [&str; 12] = [
    "null", "bool", "int", "float", "complex", "char", "string", "bytes", "array", "list", "map",
    "function",
];

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("()"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Complex(c) => write!(f, "{c}"),
            Self::Char(c) => write!(f, "{c:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Array(a) => write!(f, "{a}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("#{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Self::Function(c) => write!(f, "<function {}>", c.display_name()),
        }
    }
}

/// Takes a script value apart one level at a time.
///
/// Dropping a `Dynamic` frees nested arrays and maps recursively, so a
/// value nested deeply enough would exhaust the stack of whichever thread
/// drops it. Shared values are left to their remaining owners.
pub fn dismantle(value: Dynamic) {
    let mut pending = vec![value];
    while let Some(value) = pending.pop() {
        if value.is_shared() {
            continue;
        }
        if value.is_array() {
            if let Ok(items) = value.into_array() {
                pending.extend(items);
            }
        } else if value.is_map() {
            if let Some(map) = value.try_cast::<rhai::Map>() {
                pending.extend(map.into_values());
            }
        }
    }
}

/// [`dismantle`] for every value carried by an evaluation error
pub fn dismantle_error(err: Box<EvalAltResult>) {
    let mut current = err;
    loop {
        match *current {
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => current = inner,
            EvalAltResult::ErrorRuntime(value, _) | EvalAltResult::ErrorTerminated(value, _) => {
                dismantle(value);
                return;
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_snapshot_is_independent() {
        let inner: rhai::Array = vec![Dynamic::from(1_i64), Dynamic::from(2.5_f64)];
        let mut map = rhai::Map::new();
        map.insert("xs".into(), Dynamic::from_array(inner));
        map.insert("label".into(), Dynamic::from("abc".to_string()));
        let original = Dynamic::from_map(map);

        let snapshot = Value::from_dynamic(&original).unwrap();
        let Value::Map(fields) = &snapshot else {
            panic!("expected a map, got {snapshot:?}");
        };
        assert_eq!(
            fields["xs"],
            Value::List(vec![Value::Int(1), Value::Float(2.5)])
        );
        assert_eq!(fields["label"], Value::Str("abc".to_string()));

        let rebuilt = snapshot.clone().into_dynamic();
        assert!(rebuilt.is_map());
        assert_eq!(Value::from_dynamic(&rebuilt).unwrap(), snapshot);
    }

    #[test]
    fn test_foreign_custom_type_rejected() {
        #[derive(Clone)]
        struct Handle;

        let err = Value::from_dynamic(&Dynamic::from(Handle)).unwrap_err();
        assert!(matches!(err, ValueError::Unsupported(_)));
    }

    #[test]
    fn test_function_pointer_needs_library() {
        let fn_ptr = FnPtr::new("answer").unwrap();
        let err = Value::from_dynamic(&Dynamic::from(fn_ptr)).unwrap_err();
        assert!(matches!(err, ValueError::Unsupported(_)));
    }

    fn nested(depth: usize) -> Dynamic {
        let mut value = Dynamic::from_array(Vec::new());
        for _ in 0..depth {
            value = Dynamic::from_array(vec![value]);
        }
        value
    }

    #[test]
    fn test_depth_bound() {
        assert!(Value::from_dynamic(&nested(MAX_DEPTH - 1)).is_ok());
        assert_eq!(
            Value::from_dynamic(&nested(MAX_DEPTH)).unwrap_err(),
            ValueError::TooDeep(MAX_DEPTH)
        );
    }

    #[test]
    fn test_dismantle_deep_value() {
        let deep = nested(500_000);
        assert!(matches!(
            Value::from_dynamic(&deep),
            Err(ValueError::TooDeep(_))
        ));
        dismantle(deep);

        let err: Box<EvalAltResult> = EvalAltResult::ErrorRuntime(nested(500_000), rhai::Position::NONE).into();
        dismantle_error(err);
    }

    #[test]
    fn test_char_keeps_its_kind() {
        let snapshot = Value::from_dynamic(&Dynamic::from_char('x')).unwrap();
        assert_eq!(snapshot, Value::Char('x'));
        assert_eq!(snapshot.to_string(), "'x'");
        let rebuilt = snapshot.into_dynamic();
        assert_eq!(rebuilt.as_char(), Ok('x'));
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Str("a".to_string())]).to_string(),
            "[1, \"a\"]"
        );
    }
}
