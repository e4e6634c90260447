#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use cf_columnar::{Column, ColumnError};
use cf_frame::{DataFrame, FrameError};
use cf_groupby::GroupKey;
use cf_types::Scalar;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join column {column:?} is not unique")]
    NonUniqueJoin { column: String },
    #[error("join column {0:?} is missing")]
    UnknownJoinColumn(String),
    #[error("columns overlap between join sides: {0:?}")]
    OverlappingColumns(Vec<String>),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

fn key_of(value: &Scalar) -> Option<GroupKey> {
    (!value.is_missing()).then(|| GroupKey::from_scalars(std::slice::from_ref(value)))
}

/// Join `right` onto `left` where their `on` columns are equal.
///
/// Each left row is repeated once per matching right row; with
/// [`JoinType::Left`] unmatched left rows are kept with missing right
/// values. Missing keys never match. The output carries `on` once, from the
/// left side.
pub fn join_frames(
    left: &DataFrame,
    right: &DataFrame,
    on: &str,
    join_type: JoinType,
) -> Result<DataFrame, JoinError> {
    let left_keys = left
        .column(on)
        .ok_or_else(|| JoinError::UnknownJoinColumn(on.to_owned()))?;
    let right_keys = right
        .column(on)
        .ok_or_else(|| JoinError::UnknownJoinColumn(on.to_owned()))?;

    let overlapping = right
        .column_names()
        .filter(|name| *name != on && left.has_column(name))
        .map(str::to_owned)
        .collect::<Vec<_>>();
    if !overlapping.is_empty() {
        return Err(JoinError::OverlappingColumns(overlapping));
    }

    let mut right_map = HashMap::<GroupKey, Vec<usize>>::new();
    for (pos, value) in right_keys.values().iter().enumerate() {
        if let Some(key) = key_of(value) {
            right_map.entry(key).or_default().push(pos);
        }
    }

    let mut left_positions = Vec::<Option<usize>>::new();
    let mut right_positions = Vec::<Option<usize>>::new();
    for (left_pos, value) in left_keys.values().iter().enumerate() {
        if let Some(matches) = key_of(value).and_then(|key| right_map.get(&key)) {
            for right_pos in matches {
                left_positions.push(Some(left_pos));
                right_positions.push(Some(*right_pos));
            }
            continue;
        }

        if matches!(join_type, JoinType::Left) {
            left_positions.push(Some(left_pos));
            right_positions.push(None);
        }
    }

    let mut out = left.take(&left_positions)?;
    for (name, column) in right.columns() {
        if name == on {
            continue;
        }
        out = out.with_column(name.clone(), column.reindex_by_positions(&right_positions)?)?;
    }
    Ok(out)
}

/// Fail if appending `new_rows` to `existing` would repeat a value of `column`.
///
/// Batches without the column pass; missing values are not keys.
pub fn check_unique_join_column(
    column: &str,
    existing: &DataFrame,
    new_rows: &DataFrame,
) -> Result<(), JoinError> {
    let Some(incoming) = new_rows.column(column) else {
        return Ok(());
    };
    let combined = match existing.column(column) {
        Some(stored) => Column::concat(&[stored, incoming])?,
        None => incoming.clone(),
    };
    if combined.has_duplicates() {
        return Err(JoinError::NonUniqueJoin {
            column: column.to_owned(),
        });
    }
    Ok(())
}

/// Whether any non-missing value of `keys` also occurs in `other`.
#[must_use]
pub fn keys_intersect(keys: &Column, other: &Column) -> bool {
    let known = other.values().iter().filter_map(key_of).collect::<HashSet<_>>();
    keys.values()
        .iter()
        .filter_map(key_of)
        .any(|key| known.contains(&key))
}
