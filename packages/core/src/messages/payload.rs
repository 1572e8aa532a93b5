//! Payload variants carried by a [`Message`](super::Message).
//!
//! A message carries exactly one payload. The tagged union is the invariant:
//! there is no way to build a `Message` with zero or two payloads.

use serde_json::{Number, Value};

use crate::error::CodecError;

// ---------------------------------------------------------------------------
// Tensor
// ---------------------------------------------------------------------------

/// Dense numeric tensor: row-major `values` reshaped by `shape`.
///
/// Invariants (checked by [`Tensor::new`] and by every decoder):
/// - `shape.iter().product() == values.len()`
/// - the product of the non-zero dimensions fits in `usize`
/// - every value is finite
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl Tensor {
    /// Builds a tensor, validating shape against values.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Malformed` when the shape does not describe the
    /// number of values, or when a value is NaN or infinite.
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, CodecError> {
        if nonzero_volume(&shape).is_none() {
            return Err(CodecError::malformed(format!(
                "tensor shape {shape:?} overflows the addressable size"
            )));
        }
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(CodecError::malformed(format!(
                "tensor shape {shape:?} expects {expected} values, got {}",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CodecError::malformed("tensor values must be finite"));
        }
        Ok(Self { shape, values })
    }

    /// A tensor with no rows: `shape = [0]`.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            shape: vec![0],
            values: Vec::new(),
        }
    }

    /// A `[1, n]` tensor holding one row.
    #[must_use]
    pub fn row(values: Vec<f64>) -> Self {
        Self {
            shape: vec![1, values.len()],
            values,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<usize>, Vec<f64>) {
        (self.shape, self.values)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Length of the leading (batch) dimension.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Size of the second dimension, if the tensor has one.
    #[must_use]
    pub fn column_count(&self) -> Option<usize> {
        self.shape.get(1).copied()
    }

    /// Number of values in one slice along the leading dimension.
    fn row_stride(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Returns rows `[start, end)` along the leading dimension.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Malformed` if the range is out of bounds.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Self, CodecError> {
        if start > end || end > self.rows() {
            return Err(CodecError::malformed(format!(
                "row range {start}..{end} out of bounds for {} rows",
                self.rows()
            )));
        }
        let stride = self.row_stride();
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Ok(Self {
            shape,
            values: self.values[start * stride..end * stride].to_vec(),
        })
    }

    /// Concatenates tensors along the leading dimension.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Malformed` if the inputs are empty or their
    /// trailing dimensions differ.
    pub fn concat_rows(parts: &[Tensor]) -> Result<Self, CodecError> {
        let Some(first) = parts.first() else {
            return Err(CodecError::malformed("cannot concatenate zero tensors"));
        };
        let tail = &first.shape[1.min(first.shape.len())..];
        let mut rows = 0;
        let mut values = Vec::new();
        for part in parts {
            if part.rank() == 0 || &part.shape[1..] != tail {
                return Err(CodecError::malformed(format!(
                    "cannot concatenate shape {:?} with {:?}",
                    part.shape, first.shape
                )));
            }
            rows += part.rows();
            values.extend_from_slice(&part.values);
        }
        let mut shape = vec![rows];
        shape.extend_from_slice(tail);
        Ok(Self { shape, values })
    }

    /// Converts to nested JSON rows, the `ndarray` representation.
    #[must_use]
    pub fn to_ndarray(&self) -> Vec<Value> {
        nest(&self.shape, &self.values)
    }

    /// Builds a tensor from nested numeric JSON rows.
    ///
    /// Returns `None` when the rows are not numeric or not rectangular.
    #[must_use]
    pub fn from_ndarray(rows: &[Value]) -> Option<Self> {
        let mut shape = vec![rows.len()];
        let mut cursor = rows.first();
        while let Some(Value::Array(inner)) = cursor {
            shape.push(inner.len());
            cursor = inner.first();
        }
        let mut values = Vec::with_capacity(nonzero_volume(&shape)?.min(MAX_PREALLOC));
        flatten(rows, &shape, 0, &mut values)?;
        Tensor::new(shape, values).ok()
    }
}

const MAX_PREALLOC: usize = 1 << 16;

/// Product of the dimensions with zeros counted as 1, or `None` on overflow.
/// When this fits, every partial product of `shape` fits as well.
fn nonzero_volume(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d.max(1)))
}

fn nest(shape: &[usize], values: &[f64]) -> Vec<Value> {
    if shape.len() <= 1 {
        return values.iter().map(|v| number(*v)).collect();
    }
    let stride: usize = shape[1..].iter().product();
    (0..shape[0])
        .map(|i| Value::Array(nest(&shape[1..], &values[i * stride..(i + 1) * stride])))
        .collect()
}

fn flatten(rows: &[Value], shape: &[usize], depth: usize, out: &mut Vec<f64>) -> Option<()> {
    if rows.len() != shape[depth] {
        return None;
    }
    for row in rows {
        match row {
            Value::Array(inner) if depth + 1 < shape.len() => {
                flatten(inner, shape, depth + 1, out)?;
            }
            Value::Number(n) if depth + 1 == shape.len() => out.push(n.as_f64()?),
            _ => return None,
        }
    }
    Some(())
}

/// Finite `f64` to JSON number. Non-finite values become `null`, which
/// [`Tensor::new`] already rules out.
fn number(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The single data payload of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Numeric tensor (`data.tensor` on the wire).
    Tensor(Tensor),
    /// Ordered list of heterogeneous rows (`data.ndarray` on the wire).
    NdArray(Vec<Value>),
    /// Opaque bytes (`binData`).
    Binary(Vec<u8>),
    /// UTF-8 text (`strData`).
    Str(String),
    /// Arbitrary structured document (`jsonData`).
    Json(Value),
}

/// Discriminant of [`Payload`], used when the response must mirror the
/// request's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Tensor,
    NdArray,
    Binary,
    Str,
    Json,
}

impl PayloadKind {
    /// Wire field name of this variant.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tensor => "tensor",
            Self::NdArray => "ndarray",
            Self::Binary => "binData",
            Self::Str => "strData",
            Self::Json => "jsonData",
        }
    }
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Tensor(_) => PayloadKind::Tensor,
            Self::NdArray(_) => PayloadKind::NdArray,
            Self::Binary(_) => PayloadKind::Binary,
            Self::Str(_) => PayloadKind::Str,
            Self::Json(_) => PayloadKind::Json,
        }
    }

    /// True for the two `data` variants (tensor and ndarray), the only ones
    /// that may carry column names.
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Tensor(_) | Self::NdArray(_))
    }

    /// Numeric view of the payload: the tensor itself, or a numeric ndarray
    /// converted to a tensor.
    #[must_use]
    pub fn as_tensor(&self) -> Option<Tensor> {
        match self {
            Self::Tensor(t) => Some(t.clone()),
            Self::NdArray(rows) => Tensor::from_ndarray(rows),
            _ => None,
        }
    }

    /// Size of the second dimension for the data variants.
    #[must_use]
    pub fn column_count(&self) -> Option<usize> {
        match self {
            Self::Tensor(t) => t.column_count(),
            Self::NdArray(rows) => match rows.first() {
                Some(Value::Array(first)) => Some(first.len()),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<Tensor> for Payload {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b)
    }
}
