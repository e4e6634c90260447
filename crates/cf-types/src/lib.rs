#![forbid(unsafe_code)]

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Bool,
    Int64,
    Float64,
    Utf8,
    Datetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullKind {
    Null,
    NaN,
    NaT,
}

/// A single cell value.
///
/// `Datetime` holds whole seconds since the UNIX epoch (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Datetime(i64),
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl Scalar {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null(_) => DType::Null,
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
            Self::Datetime(_) => DType::Datetime,
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null(_) => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Null(NullKind::NaN)) || matches!(self, Self::Float64(v) if v.is_nan())
    }

    #[must_use]
    pub fn missing_for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::Float64 => Self::Null(NullKind::NaN),
            DType::Datetime => Self::Null(NullKind::NaT),
            DType::Null | DType::Bool | DType::Int64 | DType::Utf8 => Self::Null(NullKind::Null),
        }
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float64(a), Self::Float64(b)) => (a.is_nan() && b.is_nan()) || (a == b),
            (Self::Null(NullKind::NaN), Self::Float64(v))
            | (Self::Float64(v), Self::Null(NullKind::NaN)) => v.is_nan(),
            (Self::Null(_), Self::Null(_)) => true,
            _ => self == other,
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) | Self::Datetime(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null(kind) => Err(TypeError::ValueIsMissing { kind: *kind }),
            Self::Utf8(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Utf8,
            }),
        }
    }

    /// Truthiness used by logical operators and case conditions.
    pub fn to_bool(&self) -> Result<bool, TypeError> {
        match self {
            Self::Bool(v) => Ok(*v),
            Self::Int64(v) | Self::Datetime(v) => Ok(*v != 0),
            Self::Float64(v) => Ok(*v != 0.0),
            Self::Utf8(v) => Ok(!v.is_empty()),
            Self::Null(kind) => Err(TypeError::ValueIsMissing { kind: *kind }),
        }
    }

    /// Text form of a value, as compared by membership tests.
    ///
    /// Integral floats keep one decimal place (`9.0` renders as `"9.0"`).
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Null(_) => String::new(),
            Self::Bool(v) => v.to_string(),
            Self::Int64(v) => v.to_string(),
            Self::Float64(v) => {
                if v.is_nan() {
                    String::new()
                } else if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
                    format!("{v:.1}")
                } else {
                    v.to_string()
                }
            }
            Self::Utf8(v) => v.clone(),
            Self::Datetime(secs) => DateTime::from_timestamp(*secs, 0)
                .map_or_else(|| secs.to_string(), |dt| dt.to_rfc3339()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("dtype coercion from {left:?} to {right:?} has no compatible common type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("cannot cast scalar of dtype {from:?} to {to:?}")]
    InvalidCast { from: DType, to: DType },
    #[error("cannot cast float {value} to int64 without loss")]
    LossyFloatToInt { value: f64 },
    #[error("expected 0/1 for bool cast from int64 but found {value}")]
    InvalidBoolInt { value: i64 },
    #[error("expected 0.0/1.0 for bool cast from float64 but found {value}")]
    InvalidBoolFloat { value: f64 },
    #[error("value {value:?} has non-numeric dtype {dtype:?}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value is missing ({kind:?})")]
    ValueIsMissing { kind: NullKind },
    #[error("text {value:?} cannot be read as {dtype:?}")]
    Unparseable { value: String, dtype: DType },
}

pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Bool, Float64, Int64, Null};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Null, other) | (other, Null) => other,
        (Bool, Int64) | (Int64, Bool) => Int64,
        (Bool, Float64) | (Float64, Bool) => Float64,
        (Int64, Float64) | (Float64, Int64) => Float64,
        _ => return Err(TypeError::IncompatibleDtypes { left, right }),
    };

    Ok(out)
}

pub fn infer_dtype(values: &[Scalar]) -> Result<DType, TypeError> {
    let mut current = DType::Null;
    for value in values {
        current = common_dtype(current, value.dtype())?;
    }
    Ok(current)
}

pub fn cast_scalar(value: &Scalar, target: DType) -> Result<Scalar, TypeError> {
    cast_scalar_owned(value.clone(), target)
}

pub fn cast_scalar_owned(value: Scalar, target: DType) -> Result<Scalar, TypeError> {
    let from = value.dtype();
    if matches!(value, Scalar::Null(_)) {
        return Ok(Scalar::missing_for_dtype(target));
    }
    if from == target {
        return Ok(value);
    }

    match (target, value) {
        (DType::Null, _) => Ok(Scalar::Null(NullKind::Null)),
        (DType::Bool, Scalar::Int64(v)) => match v {
            0 => Ok(Scalar::Bool(false)),
            1 => Ok(Scalar::Bool(true)),
            _ => Err(TypeError::InvalidBoolInt { value: v }),
        },
        (DType::Bool, Scalar::Float64(v)) => {
            if v == 0.0 {
                Ok(Scalar::Bool(false))
            } else if v == 1.0 {
                Ok(Scalar::Bool(true))
            } else {
                Err(TypeError::InvalidBoolFloat { value: v })
            }
        }
        (DType::Int64, Scalar::Bool(v)) => Ok(Scalar::Int64(i64::from(v))),
        (DType::Int64 | DType::Datetime, Scalar::Float64(v)) => {
            if !v.is_finite() || v != v.trunc() {
                return Err(TypeError::LossyFloatToInt { value: v });
            }
            if v < i64::MIN as f64 || v > i64::MAX as f64 {
                return Err(TypeError::LossyFloatToInt { value: v });
            }
            Ok(if target == DType::Int64 {
                Scalar::Int64(v as i64)
            } else {
                Scalar::Datetime(v as i64)
            })
        }
        (DType::Int64, Scalar::Datetime(v)) => Ok(Scalar::Int64(v)),
        (DType::Datetime, Scalar::Int64(v)) => Ok(Scalar::Datetime(v)),
        (DType::Float64, Scalar::Bool(v)) => Ok(Scalar::Float64(if v { 1.0 } else { 0.0 })),
        (DType::Float64, Scalar::Int64(v) | Scalar::Datetime(v)) => Ok(Scalar::Float64(v as f64)),
        (DType::Utf8, other) => Ok(Scalar::Utf8(other.render())),
        (_, Scalar::Utf8(text)) => parse_scalar_as(&text, target),
        _ => Err(TypeError::InvalidCast { from, to: target }),
    }
}

/// Read `text` as a value of `dtype`. Empty text is the dtype's missing marker.
pub fn parse_scalar_as(text: &str, dtype: DType) -> Result<Scalar, TypeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Scalar::missing_for_dtype(dtype));
    }

    let unparseable = || TypeError::Unparseable {
        value: trimmed.to_owned(),
        dtype,
    };

    match dtype {
        DType::Null => Ok(Scalar::Null(NullKind::Null)),
        DType::Bool => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Scalar::Bool(true)),
            "false" | "0" => Ok(Scalar::Bool(false)),
            _ => Err(unparseable()),
        },
        DType::Int64 => trimmed
            .parse::<i64>()
            .map(Scalar::Int64)
            .or_else(|_| {
                let value = trimmed.parse::<f64>().map_err(|_| unparseable())?;
                cast_scalar_owned(Scalar::Float64(value), DType::Int64)
            }),
        DType::Float64 => trimmed
            .parse::<f64>()
            .map(Scalar::Float64)
            .map_err(|_| unparseable()),
        DType::Utf8 => Ok(Scalar::Utf8(trimmed.to_owned())),
        DType::Datetime => parse_datetime(trimmed)
            .map(Scalar::Datetime)
            .ok_or_else(unparseable),
    }
}

const DATE_FORMATS: [&str; 3] = ["%m-%d-%Y", "%Y-%m-%d", "%d/%m/%Y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Seconds since the UNIX epoch for a date or timestamp string.
#[must_use]
pub fn parse_datetime(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp());
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc().timestamp());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
        }
    }
    None
}
