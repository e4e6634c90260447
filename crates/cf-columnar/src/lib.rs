#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::HashSet;

use cf_types::{DType, NullKind, Scalar, TypeError, cast_scalar_owned, common_dtype, infer_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityMask {
    bits: Vec<bool>,
}

impl ValidityMask {
    #[must_use]
    pub fn from_values(values: &[Scalar]) -> Self {
        let bits = values.iter().map(|value| !value.is_missing()).collect();
        Self { bits }
    }

    #[must_use]
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    #[must_use]
    pub fn count_valid(&self) -> usize {
        self.bits.iter().filter(|bit| **bit).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
    validity: ValidityMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Gt,
    Lt,
    Eq,
    Ne,
    Ge,
    Le,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl Column {
    /// Construct a column, coercing values to the target dtype.
    /// Takes ownership of the values so already-typed values are not cloned.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let needs_coercion = values.iter().any(|v| {
            let d = v.dtype();
            d != dtype && d != DType::Null
        });

        let coerced = if needs_coercion {
            values
                .into_iter()
                .map(|value| cast_scalar_owned(value, dtype))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            values
                .into_iter()
                .map(|value| match value {
                    Scalar::Null(_) => Scalar::missing_for_dtype(dtype),
                    other => other,
                })
                .collect()
        };

        let validity = ValidityMask::from_values(&coerced);

        Ok(Self {
            dtype,
            values: coerced,
            validity,
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    /// A column of `len` missing values.
    #[must_use]
    pub fn missing(dtype: DType, len: usize) -> Self {
        let values = vec![Scalar::missing_for_dtype(dtype); len];
        let validity = ValidityMask::from_values(&values);
        Self {
            dtype,
            values,
            validity,
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Scalar> {
        self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    pub fn reindex_by_positions(&self, positions: &[Option<usize>]) -> Result<Self, ColumnError> {
        let values = positions
            .iter()
            .map(|slot| match slot {
                Some(idx) => self
                    .values
                    .get(*idx)
                    .cloned()
                    .unwrap_or_else(|| Scalar::missing_for_dtype(self.dtype)),
                None => Scalar::missing_for_dtype(self.dtype),
            })
            .collect::<Vec<_>>();

        Self::new(self.dtype, values)
    }

    /// Keep the rows whose mask bit is set.
    pub fn filter(&self, mask: &[bool]) -> Result<Self, ColumnError> {
        if mask.len() != self.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: mask.len(),
            });
        }
        let values = self
            .values
            .iter()
            .zip(mask)
            .filter(|(_, keep)| **keep)
            .map(|(value, _)| value.clone())
            .collect();
        Self::new(self.dtype, values)
    }

    /// Stack columns end to end under their common dtype.
    pub fn concat(columns: &[&Self]) -> Result<Self, ColumnError> {
        let mut dtype = DType::Null;
        for column in columns {
            dtype = common_dtype(dtype, column.dtype)?;
        }
        let values = columns
            .iter()
            .flat_map(|column| column.values.iter().cloned())
            .collect();
        Self::new(dtype, values)
    }

    /// Whether any two present values render identically.
    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.len());
        self.values
            .iter()
            .filter(|value| !value.is_missing())
            .any(|value| !seen.insert(value.render()))
    }

    pub fn binary_numeric(&self, right: &Self, op: ArithmeticOp) -> Result<Self, ColumnError> {
        if self.len() != right.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: right.len(),
            });
        }

        let values = self
            .values
            .iter()
            .zip(&right.values)
            .map(|(left, right)| arithmetic(left, right, op))
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_values(values)
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(left, right)| left.semantic_eq(right))
    }
}

/// Apply `op` to two scalars.
///
/// Missing operands yield a missing result. Integer operands give an exact
/// integer; division and results that do not fit `i64` fall back to float.
/// `Datetime - Datetime` is a span in seconds.
pub fn arithmetic(left: &Scalar, right: &Scalar, op: ArithmeticOp) -> Result<Scalar, TypeError> {
    if left.is_missing() || right.is_missing() {
        return Ok(Scalar::Null(NullKind::NaN));
    }

    match (left, right, op) {
        (Scalar::Datetime(a), Scalar::Datetime(b), ArithmeticOp::Sub) => {
            return Ok(a
                .checked_sub(*b)
                .map_or(Scalar::Null(NullKind::NaN), Scalar::Int64));
        }
        (Scalar::Datetime(a), Scalar::Int64(b), ArithmeticOp::Add)
        | (Scalar::Int64(b), Scalar::Datetime(a), ArithmeticOp::Add) => {
            return Ok(a
                .checked_add(*b)
                .map_or(Scalar::Null(NullKind::NaT), Scalar::Datetime));
        }
        (Scalar::Datetime(a), Scalar::Int64(b), ArithmeticOp::Sub) => {
            return Ok(a
                .checked_sub(*b)
                .map_or(Scalar::Null(NullKind::NaT), Scalar::Datetime));
        }
        _ => {}
    }

    if let (Some(lhs), Some(rhs)) = (integral_value(left), integral_value(right))
        && let Some(result) = integer_arithmetic(lhs, rhs, op)
    {
        return Ok(Scalar::Int64(result));
    }

    let lhs = left.to_f64()?;
    let rhs = right.to_f64()?;
    let result = match op {
        ArithmeticOp::Add => lhs + rhs,
        ArithmeticOp::Sub => lhs - rhs,
        ArithmeticOp::Mul => lhs * rhs,
        ArithmeticOp::Div => lhs / rhs,
        ArithmeticOp::Pow => lhs.powf(rhs),
    };
    Ok(Scalar::Float64(result))
}

fn integral_value(value: &Scalar) -> Option<i64> {
    match value {
        Scalar::Int64(v) => Some(*v),
        Scalar::Bool(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// Exact integer result, or `None` when it overflows or is not integral.
fn integer_arithmetic(lhs: i64, rhs: i64, op: ArithmeticOp) -> Option<i64> {
    match op {
        ArithmeticOp::Add => lhs.checked_add(rhs),
        ArithmeticOp::Sub => lhs.checked_sub(rhs),
        ArithmeticOp::Mul => lhs.checked_mul(rhs),
        ArithmeticOp::Div => None,
        ArithmeticOp::Pow => u32::try_from(rhs)
            .ok()
            .and_then(|exp| lhs.checked_pow(exp)),
    }
}

/// Compare two scalars. Missing operands compare as missing.
pub fn compare(left: &Scalar, right: &Scalar, op: ComparisonOp) -> Result<Scalar, TypeError> {
    if left.is_missing() || right.is_missing() {
        return Ok(Scalar::Null(NullKind::Null));
    }

    let ordering = match (left, right) {
        (Scalar::Utf8(a), Scalar::Utf8(b)) => a.cmp(b),
        (Scalar::Utf8(_), _) | (_, Scalar::Utf8(_)) => {
            return match op {
                ComparisonOp::Eq => Ok(Scalar::Bool(false)),
                ComparisonOp::Ne => Ok(Scalar::Bool(true)),
                _ => Err(TypeError::IncompatibleDtypes {
                    left: left.dtype(),
                    right: right.dtype(),
                }),
            };
        }
        _ => {
            let lhs = left.to_f64()?;
            let rhs = right.to_f64()?;
            lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal)
        }
    };

    let out = match op {
        ComparisonOp::Gt => ordering == Ordering::Greater,
        ComparisonOp::Lt => ordering == Ordering::Less,
        ComparisonOp::Eq => ordering == Ordering::Equal,
        ComparisonOp::Ne => ordering != Ordering::Equal,
        ComparisonOp::Ge => ordering != Ordering::Less,
        ComparisonOp::Le => ordering != Ordering::Greater,
    };
    Ok(Scalar::Bool(out))
}
