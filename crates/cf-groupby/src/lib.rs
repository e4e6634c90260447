#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

use cf_columnar::{ArithmeticOp, Column, ColumnError};
use cf_frame::{DataFrame, FrameError};
use cf_types::{DType, NullKind, Scalar, TypeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The reductions a formula may name, e.g. `ratio(a, b)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Max,
    Mean,
    Median,
    Min,
    Sum,
    Ratio,
}

static REGISTRY: LazyLock<BTreeMap<&'static str, AggregationKind>> = LazyLock::new(|| {
    AggregationKind::ALL
        .iter()
        .map(|kind| (kind.formula_name(), *kind))
        .collect()
});

impl AggregationKind {
    pub const ALL: [Self; 6] = [
        Self::Max,
        Self::Mean,
        Self::Median,
        Self::Min,
        Self::Sum,
        Self::Ratio,
    ];

    #[must_use]
    pub const fn formula_name(self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Mean => "mean",
            Self::Median => "median",
            Self::Min => "min",
            Self::Sum => "sum",
            Self::Ratio => "ratio",
        }
    }

    /// Look up a formula name, ignoring ASCII case.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        REGISTRY.get(name.to_ascii_lowercase().as_str()).copied()
    }

    /// Number of argument expressions the formula call takes.
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Ratio => 2,
            _ => 1,
        }
    }

    /// Multi-column aggregations persist a numerator and denominator.
    #[must_use]
    pub const fn is_multi_column(self) -> bool {
        matches!(self, Self::Mean | Self::Ratio)
    }

    /// Whether stored results can absorb new rows without a rescan.
    #[must_use]
    pub const fn is_reducible(self) -> bool {
        matches!(self, Self::Sum | Self::Mean | Self::Ratio)
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.formula_name())
    }
}

/// Name-to-variant table used for reserved words and dispatch.
#[must_use]
pub fn registry() -> &'static BTreeMap<&'static str, AggregationKind> {
    &REGISTRY
}

#[must_use]
pub fn numerator_column(name: &str) -> String {
    format!("{name}_numerator")
}

#[must_use]
pub fn denominator_column(name: &str) -> String {
    format!("{name}_denominator")
}

/// Columns whose stored values are combined on incremental updates.
#[must_use]
pub fn accumulator_columns(kind: AggregationKind, name: &str) -> Vec<String> {
    if kind.is_multi_column() {
        vec![numerator_column(name), denominator_column(name)]
    } else {
        vec![name.to_owned()]
    }
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{kind} expects {expected} argument column(s) but received {actual}")]
    Arity {
        kind: AggregationKind,
        expected: usize,
        actual: usize,
    },
    #[error("{0} results cannot be combined incrementally")]
    NotReducible(AggregationKind),
    #[error("group column {0:?} is missing")]
    MissingGroupColumn(String),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Hashable identity of one group-key tuple.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq)]
pub struct GroupKey(Vec<KeyPart>);

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum KeyPart {
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(String),
    Datetime(i64),
    Null(NullKind),
}

impl KeyPart {
    fn from_scalar(key: &Scalar) -> Self {
        match key {
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 => {
                Self::Int64(*v as i64)
            }
            Scalar::Float64(v) => Self::FloatBits(if v.is_nan() {
                f64::NAN.to_bits()
            } else {
                v.to_bits()
            }),
            Scalar::Utf8(v) => Self::Utf8(v.clone()),
            Scalar::Datetime(v) => Self::Datetime(*v),
            Scalar::Null(kind) => Self::Null(*kind),
        }
    }
}

impl GroupKey {
    #[must_use]
    pub fn from_scalars(values: &[Scalar]) -> Self {
        Self(values.iter().map(KeyPart::from_scalar).collect())
    }

    /// Key of row `idx` of `frame` over `groups`; missing columns read as null.
    #[must_use]
    pub fn of_row(frame: &DataFrame, groups: &[String], idx: usize) -> Self {
        let values = groups
            .iter()
            .map(|group| {
                frame
                    .column(group)
                    .and_then(|column| column.value(idx))
                    .cloned()
                    .unwrap_or(Scalar::Null(NullKind::Null))
            })
            .collect::<Vec<_>>();
        Self::from_scalars(&values)
    }
}

struct Grouping {
    key_values: Vec<Vec<Scalar>>,
    positions: Vec<Vec<usize>>,
}

fn group_rows(
    group_frame: &DataFrame,
    groups: &[String],
    row_count: usize,
) -> Result<Grouping, AggregationError> {
    if groups.is_empty() {
        return Ok(Grouping {
            key_values: vec![Vec::new()],
            positions: vec![(0..row_count).collect()],
        });
    }

    let columns = groups
        .iter()
        .map(|group| {
            group_frame
                .column(group)
                .ok_or_else(|| AggregationError::MissingGroupColumn(group.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut slot = HashMap::<GroupKey, usize>::new();
    let mut grouping = Grouping {
        key_values: Vec::new(),
        positions: Vec::new(),
    };

    for row in 0..row_count {
        let values = columns
            .iter()
            .map(|column| {
                column
                    .value(row)
                    .cloned()
                    .unwrap_or(Scalar::Null(NullKind::Null))
            })
            .collect::<Vec<_>>();
        // Rows with a missing key belong to no group.
        if values.iter().any(Scalar::is_missing) {
            continue;
        }

        let key = GroupKey::from_scalars(&values);
        let idx = match slot.get(&key) {
            Some(idx) => *idx,
            None => {
                let idx = grouping.positions.len();
                slot.insert(key, idx);
                grouping.key_values.push(values);
                grouping.positions.push(Vec::new());
                idx
            }
        };
        grouping.positions[idx].push(row);
    }

    Ok(grouping)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Reduced {
    Scalar(f64),
    Fraction { numerator: f64, denominator: f64 },
}

fn numeric_at(column: &Column, pos: usize) -> Result<Option<f64>, AggregationError> {
    match column.value(pos) {
        Some(value) if !value.is_missing() => Ok(Some(value.to_f64()?)),
        _ => Ok(None),
    }
}

fn present_values(column: &Column, positions: &[usize]) -> Result<Vec<f64>, AggregationError> {
    let mut out = Vec::with_capacity(positions.len());
    for pos in positions {
        if let Some(value) = numeric_at(column, *pos)? {
            out.push(value);
        }
    }
    Ok(out)
}

fn reduce_group(
    kind: AggregationKind,
    columns: &[Column],
    positions: &[usize],
) -> Result<Reduced, AggregationError> {
    let reduced = match kind {
        AggregationKind::Sum => Reduced::Scalar(present_values(&columns[0], positions)?.iter().sum()),
        AggregationKind::Max => Reduced::Scalar(
            present_values(&columns[0], positions)?
                .into_iter()
                .reduce(f64::max)
                .unwrap_or(f64::NAN),
        ),
        AggregationKind::Min => Reduced::Scalar(
            present_values(&columns[0], positions)?
                .into_iter()
                .reduce(f64::min)
                .unwrap_or(f64::NAN),
        ),
        AggregationKind::Median => {
            let mut values = present_values(&columns[0], positions)?;
            values.sort_by(f64::total_cmp);
            let n = values.len();
            Reduced::Scalar(match n {
                0 => f64::NAN,
                _ if n % 2 == 1 => values[n / 2],
                _ => (values[n / 2 - 1] + values[n / 2]) / 2.0,
            })
        }
        AggregationKind::Mean => Reduced::Fraction {
            // Every row in the group counts, missing values included.
            numerator: present_values(&columns[0], positions)?.iter().sum(),
            denominator: positions.len() as f64,
        },
        AggregationKind::Ratio => {
            // Rows missing either operand count toward neither sum.
            let mut numerator = 0.0;
            let mut denominator = 0.0;
            for pos in positions {
                if let (Some(a), Some(b)) =
                    (numeric_at(&columns[0], *pos)?, numeric_at(&columns[1], *pos)?)
                {
                    numerator += a;
                    denominator += b;
                }
            }
            Reduced::Fraction {
                numerator,
                denominator,
            }
        }
    };
    Ok(reduced)
}

/// Aggregate `columns` over every row.
///
/// With no `groups` the result is a single row holding the value under
/// `name`. Otherwise `group_frame` supplies the group columns for the same
/// rows and the result has one row per distinct key in first-seen order.
/// Mean and ratio add `<name>_numerator` and `<name>_denominator`.
pub fn compute_full(
    kind: AggregationKind,
    name: &str,
    groups: &[String],
    group_frame: &DataFrame,
    columns: &[Column],
) -> Result<DataFrame, AggregationError> {
    if columns.len() != kind.arity() {
        return Err(AggregationError::Arity {
            kind,
            expected: kind.arity(),
            actual: columns.len(),
        });
    }
    let row_count = columns[0].len();
    for column in &columns[1..] {
        if column.len() != row_count {
            return Err(ColumnError::LengthMismatch {
                left: row_count,
                right: column.len(),
            }
            .into());
        }
    }

    let grouping = group_rows(group_frame, groups, row_count)?;
    let reduced = grouping
        .positions
        .iter()
        .map(|positions| reduce_group(kind, columns, positions))
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = DataFrame::empty();
    for (slot, group) in groups.iter().enumerate() {
        let dtype = group_frame
            .column(group)
            .map_or(DType::Null, Column::dtype);
        let values = grouping
            .key_values
            .iter()
            .map(|key| key[slot].clone())
            .collect();
        out = out.with_column(group.clone(), Column::new(dtype, values)?)?;
    }

    let value_of = |reduced: &Reduced| match reduced {
        Reduced::Scalar(value) => *value,
        Reduced::Fraction {
            numerator,
            denominator,
        } => numerator / denominator,
    };
    out = out.with_column(name, float_column(reduced.iter().map(value_of))?)?;

    if kind.is_multi_column() {
        let parts = reduced
            .iter()
            .map(|reduced| match reduced {
                Reduced::Fraction {
                    numerator,
                    denominator,
                } => (*numerator, *denominator),
                Reduced::Scalar(value) => (*value, 1.0),
            })
            .collect::<Vec<_>>();
        out = out.with_column(
            numerator_column(name),
            float_column(parts.iter().map(|(n, _)| *n))?,
        )?;
        out = out.with_column(
            denominator_column(name),
            float_column(parts.iter().map(|(_, d)| *d))?,
        )?;
    }

    Ok(out)
}

fn float_column(values: impl Iterator<Item = f64>) -> Result<Column, ColumnError> {
    Column::new(DType::Float64, values.map(Scalar::Float64).collect())
}

/// Fold the contribution of new rows into previously stored results.
///
/// Only the new rows are scanned. Their per-group accumulators are added to
/// the matching rows of `existing`; keys not yet present are appended. For
/// multi-column aggregations the exposed value is re-derived from the
/// updated numerator and denominator. Other columns of `existing` are kept.
pub fn reduce(
    kind: AggregationKind,
    name: &str,
    groups: &[String],
    existing: &DataFrame,
    group_frame: &DataFrame,
    columns: &[Column],
) -> Result<DataFrame, AggregationError> {
    if !kind.is_reducible() {
        return Err(AggregationError::NotReducible(kind));
    }

    let delta = compute_full(kind, name, groups, group_frame, columns)?;
    if existing.is_empty() {
        return Ok(delta);
    }

    let existing_index = (0..existing.len())
        .map(|idx| (GroupKey::of_row(existing, groups, idx), idx))
        .collect::<HashMap<_, _>>();

    let accumulators = accumulator_columns(kind, name);
    let mut totals = accumulators
        .iter()
        .map(|column| {
            let values = existing
                .column(column)
                .map_or_else(
                    || vec![Scalar::Null(NullKind::NaN); existing.len()],
                    |col| col.values().to_vec(),
                );
            (column.clone(), values)
        })
        .collect::<BTreeMap<_, _>>();

    let mut appended = Vec::new();
    for idx in 0..delta.len() {
        let key = GroupKey::of_row(&delta, groups, idx);
        let Some(target) = existing_index.get(&key) else {
            appended.push(Some(idx));
            continue;
        };
        for (column, values) in &mut totals {
            let addend = delta
                .column(column)
                .and_then(|col| col.value(idx))
                .map_or(0.0, |value| value.to_f64().unwrap_or(0.0));
            let stored = values[*target].to_f64().unwrap_or(0.0);
            values[*target] = Scalar::Float64(stored + addend);
        }
    }

    let mut updated = existing.clone();
    for (column, values) in totals {
        updated = updated.with_column(column, Column::new(DType::Float64, values)?)?;
    }
    let additions = delta.take(&appended)?;
    let mut merged = DataFrame::concat(&[&updated, &additions])?;

    if kind.is_multi_column() {
        let numerator = merged.require_column(&numerator_column(name))?;
        let denominator = merged.require_column(&denominator_column(name))?;
        let value = numerator.binary_numeric(denominator, ArithmeticOp::Div)?;
        let value = Column::new(DType::Float64, value.into_values())?;
        merged = merged.with_column(name, value)?;
    }

    Ok(merged)
}

/// Row positions of the key union of two grouped frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAlignment {
    pub left_positions: Vec<Option<usize>>,
    pub right_positions: Vec<Option<usize>>,
}

/// Align `left` and `right` rows by group key: left keys first, then keys
/// only present on the right.
#[must_use]
pub fn align_groups(left: &DataFrame, right: &DataFrame, groups: &[String]) -> GroupAlignment {
    let mut right_index = HashMap::<GroupKey, usize>::with_capacity(right.len());
    for idx in 0..right.len() {
        right_index
            .entry(GroupKey::of_row(right, groups, idx))
            .or_insert(idx);
    }

    let mut left_positions = Vec::with_capacity(left.len() + right.len());
    let mut right_positions = Vec::with_capacity(left.len() + right.len());
    let mut matched = vec![false; right.len()];
    for idx in 0..left.len() {
        let hit = right_index.get(&GroupKey::of_row(left, groups, idx)).copied();
        if let Some(pos) = hit {
            matched[pos] = true;
        }
        left_positions.push(Some(idx));
        right_positions.push(hit);
    }
    for (idx, seen) in matched.into_iter().enumerate() {
        if !seen {
            left_positions.push(None);
            right_positions.push(Some(idx));
        }
    }

    GroupAlignment {
        left_positions,
        right_positions,
    }
}

/// Replace the columns `update` carries inside `existing`, matching rows by
/// group key. Used when several aggregations share one aggregated dataset.
pub fn merge_on_groups(
    existing: &DataFrame,
    update: &DataFrame,
    groups: &[String],
) -> Result<DataFrame, AggregationError> {
    if existing.columns().is_empty() {
        return Ok(update.clone());
    }

    let plan = align_groups(existing, update, groups);
    let mut out = DataFrame::empty();

    for group in groups {
        let from_left = existing.column(group);
        let from_right = update.column(group);
        let dtype = from_left.or(from_right).map_or(DType::Null, Column::dtype);
        let values = plan
            .left_positions
            .iter()
            .zip(&plan.right_positions)
            .map(|(left, right)| {
                left.and_then(|pos| from_left.and_then(|col| col.value(pos)))
                    .or_else(|| right.and_then(|pos| from_right.and_then(|col| col.value(pos))))
                    .cloned()
                    .unwrap_or(Scalar::Null(NullKind::Null))
            })
            .collect();
        out = out.with_column(group.clone(), Column::new(dtype, values)?)?;
    }

    for (name, column) in existing.columns() {
        if groups.contains(name) || update.has_column(name) {
            continue;
        }
        out = out.with_column(name.clone(), column.reindex_by_positions(&plan.left_positions)?)?;
    }
    for (name, column) in update.columns() {
        if groups.contains(name) {
            continue;
        }
        out = out.with_column(name.clone(), column.reindex_by_positions(&plan.right_positions)?)?;
    }

    Ok(out)
}
