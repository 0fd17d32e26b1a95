use std::fmt;
use std::ops::Sub;

use super::{Value, ValueError};

/// A complex number in rectangular form
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    pub fn real(re: f64) -> Self {
        Self { re, im: 0.0 }
    }

    /// Modulus
    pub fn norm(self) -> f64 {
        self.re.hypot(self.im)
    }

    pub fn is_nan(self) -> bool {
        self.re.is_nan() || self.im.is_nan()
    }

    pub fn is_infinite(self) -> bool {
        self.re.is_infinite() || self.im.is_infinite()
    }
}

impl Sub for Complex {
    type Output = Complex;

    fn sub(self, rhs: Complex) -> Complex {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl fmt::Display for Complex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.im.is_sign_negative() {
            write!(f, "({}-{}i)", self.re, -self.im)
        } else {
            write!(f, "({}+{}i)", self.re, self.im)
        }
    }
}

/// Element kind of an [`NdArray`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DType {
    Bool,
    Int,
    Float,
    Complex,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int64",
            Self::Float => "float64",
            Self::Complex => "complex128",
        }
    }

    /// Floating or complex elements
    pub fn is_inexact(self) -> bool {
        matches!(self, Self::Float | Self::Complex)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Complex(Vec<Complex>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Complex(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dense n-dimensional array stored in row-major order.
///
/// This is the array-like container that grading code inspects with the
/// sanity/feature/closeness checks; it only supports what those checks and
/// simple construction need.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    /// Float array of zeros; fails instead of aborting when the shape is
    /// too large to allocate.
    pub fn zeros(shape: Vec<usize>) -> Result<Self, ValueError> {
        let len = element_count(&shape)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| ValueError::TooLarge(format_shape(&shape)))?;
        data.resize(len, 0.0);
        Ok(Self {
            shape,
            data: ArrayData::Float(data),
        })
    }

    pub fn from_floats(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, ValueError> {
        Self::with_data(shape, ArrayData::Float(data))
    }

    pub fn with_data(shape: Vec<usize>, data: ArrayData) -> Result<Self, ValueError> {
        if element_count(&shape)? != data.len() {
            return Err(ValueError::Ragged);
        }
        Ok(Self { shape, data })
    }

    /// Builds an array from a (possibly nested) list of numbers.
    ///
    /// The element kind is the widest kind found among the leaves; an empty
    /// list yields a float array.
    pub fn from_nested(value: &Value) -> Result<Self, ValueError> {
        let mut shape = Vec::new();
        let mut cursor = value;
        while let Value::List(items) = cursor {
            shape.push(items.len());
            match items.first() {
                Some(first) => cursor = first,
                None => break,
            }
        }

        let mut leaves = Vec::new();
        flatten(value, 0, &shape, &mut leaves)?;

        let mut dtype = if leaves.is_empty() {
            DType::Float
        } else {
            DType::Bool
        };
        for leaf in &leaves {
            let kind = match leaf {
                Value::Bool(_) => DType::Bool,
                Value::Int(_) => DType::Int,
                Value::Float(_) => DType::Float,
                Value::Complex(_) => DType::Complex,
                other => return Err(ValueError::NotNumeric(other.kind())),
            };
            dtype = dtype.max(kind);
        }

        let data = match dtype {
            DType::Bool => ArrayData::Bool(
                leaves
                    .iter()
                    .map(|v| matches!(v, Value::Bool(true)))
                    .collect(),
            ),
            DType::Int => ArrayData::Int(
                leaves
                    .iter()
                    .map(|v| match v {
                        Value::Int(i) => *i,
                        Value::Bool(b) => i64::from(*b),
                        _ => 0,
                    })
                    .collect(),
            ),
            DType::Float => ArrayData::Float(
                leaves
                    .iter()
                    .map(|v| scalar_of(v).map(|c| c.re).unwrap_or(0.0))
                    .collect(),
            ),
            DType::Complex => ArrayData::Complex(
                leaves
                    .iter()
                    .map(|v| scalar_of(v).unwrap_or_default())
                    .collect(),
            ),
        };

        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            ArrayData::Bool(_) => DType::Bool,
            ArrayData::Int(_) => DType::Int,
            ArrayData::Float(_) => DType::Float,
            ArrayData::Complex(_) => DType::Complex,
        }
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    /// Element at a flat (row-major) index
    pub fn get(&self, index: usize) -> Option<Value> {
        match &self.data {
            ArrayData::Bool(v) => v.get(index).copied().map(Value::Bool),
            ArrayData::Int(v) => v.get(index).copied().map(Value::Int),
            ArrayData::Float(v) => v.get(index).copied().map(Value::Float),
            ArrayData::Complex(v) => v.get(index).copied().map(Value::Complex),
        }
    }

    /// Stores an element at a flat index, converting to the array's element kind.
    ///
    /// Narrowing conversions (e.g. a float into an int array) are rejected.
    pub fn set(&mut self, index: usize, value: &Value) -> Result<(), ValueError> {
        let len = self.len();
        if index >= len {
            return Err(ValueError::OutOfBounds { index, len });
        }
        match (&mut self.data, value) {
            (ArrayData::Bool(v), Value::Bool(b)) => v[index] = *b,
            (ArrayData::Int(v), Value::Int(i)) => v[index] = *i,
            (ArrayData::Int(v), Value::Bool(b)) => v[index] = i64::from(*b),
            (ArrayData::Float(v), Value::Float(f)) => v[index] = *f,
            (ArrayData::Float(v), Value::Int(i)) => v[index] = *i as f64,
            (ArrayData::Complex(v), other) => match scalar_of(other) {
                Some(c) => v[index] = c,
                None => return Err(ValueError::NotNumeric(other.kind())),
            },
            (_, other) => {
                return Err(ValueError::ElementKind {
                    expected: self.dtype().name(),
                    found: other.kind(),
                });
            }
        }
        Ok(())
    }

    /// Element at a flat index widened to a complex number
    pub fn complex_at(&self, index: usize) -> Complex {
        match &self.data {
            ArrayData::Bool(v) => Complex::real(if v[index] { 1.0 } else { 0.0 }),
            ArrayData::Int(v) => Complex::real(v[index] as f64),
            ArrayData::Float(v) => Complex::real(v[index]),
            ArrayData::Complex(v) => v[index],
        }
    }

    pub fn has_nan(&self) -> bool {
        (0..self.len()).any(|i| self.complex_at(i).is_nan())
    }

    pub fn has_inf(&self) -> bool {
        (0..self.len()).any(|i| self.complex_at(i).is_infinite())
    }

    /// Nested list with the same shape as the array
    pub fn to_nested(&self) -> Value {
        let mut next = 0;
        self.nest(0, &mut next)
    }

    fn nest(&self, axis: usize, next: &mut usize) -> Value {
        if axis == self.shape.len() {
            let value = self.get(*next).unwrap_or(Value::Null);
            *next += 1;
            return value;
        }
        Value::List(
            (0..self.shape[axis])
                .map(|_| self.nest(axis + 1, next))
                .collect(),
        )
    }

    /// Shape formatted like a tuple, e.g. `(2, 3)` or `(4,)`
    pub fn shape_string(&self) -> String {
        format_shape(&self.shape)
    }
}

impl fmt::Display for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array({}, dtype={})", self.to_nested(), self.dtype().name())
    }
}

/// Number of elements an array of `shape` holds.
///
/// Every axis counts toward the overflow bound, so a zero-length axis cannot
/// hide an absurd one elsewhere in the shape.
fn element_count(shape: &[usize]) -> Result<usize, ValueError> {
    let mut span: usize = 1;
    for &dim in shape {
        span = span
            .checked_mul(dim.max(1))
            .ok_or_else(|| ValueError::TooLarge(format_shape(shape)))?;
    }
    Ok(if shape.contains(&0) { 0 } else { span })
}

pub fn format_shape(shape: &[usize]) -> String {
    match shape {
        [single] => format!("({single},)"),
        _ => {
            let parts: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    }
}

fn flatten(
    value: &Value,
    depth: usize,
    shape: &[usize],
    out: &mut Vec<Value>,
) -> Result<(), ValueError> {
    match value {
        Value::List(items) => {
            if depth >= shape.len() || items.len() != shape[depth] {
                return Err(ValueError::Ragged);
            }
            for item in items {
                flatten(item, depth + 1, shape, out)?;
            }
            Ok(())
        }
        leaf => {
            if depth != shape.len() {
                return Err(ValueError::Ragged);
            }
            out.push(leaf.clone());
            Ok(())
        }
    }
}

/// Numeric scalar widened to complex; `None` for non-numeric values
pub fn scalar_of(value: &Value) -> Option<Complex> {
    match value {
        Value::Bool(b) => Some(Complex::real(if *b { 1.0 } else { 0.0 })),
        Value::Int(i) => Some(Complex::real(*i as f64)),
        Value::Float(f) => Some(Complex::real(*f)),
        Value::Complex(c) => Some(*c),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(rows: &[&[f64]]) -> Value {
        Value::List(
            rows.iter()
                .map(|row| Value::List(row.iter().map(|f| Value::Float(*f)).collect()))
                .collect(),
        )
    }

    #[test]
    fn test_shape_and_dtype_inference() {
        let array = NdArray::from_nested(&floats(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]])).unwrap();
        assert_eq!(array.shape(), &[2, 3]);
        assert_eq!(array.dtype(), DType::Float);
        assert_eq!(array.shape_string(), "(2, 3)");
        assert_eq!(array.get(4), Some(Value::Float(5.0)));

        let mixed = Value::List(vec![Value::Int(1), Value::Float(2.5)]);
        let array = NdArray::from_nested(&mixed).unwrap();
        assert_eq!(array.dtype(), DType::Float);
        assert_eq!(array.shape_string(), "(2,)");

        let ints = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(NdArray::from_nested(&ints).unwrap().dtype(), DType::Int);
    }

    #[test]
    fn test_ragged_and_non_numeric_rejected() {
        let ragged = Value::List(vec![
            Value::List(vec![Value::Float(1.0)]),
            Value::List(vec![Value::Float(1.0), Value::Float(2.0)]),
        ]);
        assert!(matches!(NdArray::from_nested(&ragged), Err(ValueError::Ragged)));

        let text = Value::List(vec![Value::Str("a".to_string())]);
        assert!(matches!(
            NdArray::from_nested(&text),
            Err(ValueError::NotNumeric("string"))
        ));
    }

    #[test]
    fn test_set_respects_element_kind() {
        let mut array = NdArray::from_nested(&Value::List(vec![Value::Int(1), Value::Int(2)])).unwrap();
        assert!(array.set(1, &Value::Int(7)).is_ok());
        assert!(array.set(0, &Value::Float(0.5)).is_err());
        assert!(matches!(
            array.set(5, &Value::Int(1)),
            Err(ValueError::OutOfBounds { index: 5, len: 2 })
        ));
        assert_eq!(array.to_nested(), Value::List(vec![Value::Int(1), Value::Int(7)]));
    }

    #[test]
    fn test_oversized_shapes_fail_without_allocating() {
        assert!(matches!(
            NdArray::zeros(vec![1 << 62]),
            Err(ValueError::TooLarge(_))
        ));
        assert!(matches!(
            NdArray::zeros(vec![1 << 40, 1 << 40]),
            Err(ValueError::TooLarge(_))
        ));
        assert!(matches!(
            NdArray::zeros(vec![0, usize::MAX, 2]),
            Err(ValueError::TooLarge(_))
        ));
        assert!(matches!(
            NdArray::from_floats(vec![usize::MAX, 2], Vec::new()),
            Err(ValueError::TooLarge(_))
        ));

        let empty = NdArray::zeros(vec![3, 0]).unwrap();
        assert_eq!(empty.len(), 0);
        assert_eq!(NdArray::zeros(vec![2, 3]).unwrap().len(), 6);
    }

    #[test]
    fn test_non_finite_detection() {
        let array = NdArray::from_floats(vec![3], vec![1.0, f64::NAN, 2.0]).unwrap();
        assert!(array.has_nan());
        assert!(!array.has_inf());
        let array = NdArray::from_floats(vec![1], vec![f64::INFINITY]).unwrap();
        assert!(array.has_inf());
    }
}
