#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use cf_columnar::{Column, ColumnError};
use cf_types::{DType, NullKind, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One record keyed by column name.
pub type Row = BTreeMap<String, Scalar>;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame has {frame_len} rows but column {column:?} has {column_len}")]
    LengthMismatch {
        column: String,
        frame_len: usize,
        column_len: usize,
    },
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// A table of equally long named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    len: usize,
    columns: BTreeMap<String, Column>,
}

impl DataFrame {
    pub fn new(columns: BTreeMap<String, Column>) -> Result<Self, FrameError> {
        let len = columns.values().next().map_or(0, Column::len);
        for (name, column) in &columns {
            if column.len() != len {
                return Err(FrameError::LengthMismatch {
                    column: name.clone(),
                    frame_len: len,
                    column_len: column.len(),
                });
            }
        }

        Ok(Self { len, columns })
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a frame from records, inferring each column's dtype.
    ///
    /// Keys absent from a record become missing values in that row.
    pub fn from_rows(rows: &[Row]) -> Result<Self, FrameError> {
        Self::from_rows_typed(rows, |_| None)
    }

    /// Build a frame from records, using `dtype_of` for columns it knows and
    /// inference for the rest.
    pub fn from_rows_typed(
        rows: &[Row],
        dtype_of: impl Fn(&str) -> Option<DType>,
    ) -> Result<Self, FrameError> {
        let names = rows
            .iter()
            .flat_map(|row| row.keys().cloned())
            .collect::<BTreeSet<_>>();

        let mut columns = BTreeMap::new();
        for name in names {
            let values = rows
                .iter()
                .map(|row| {
                    row.get(&name)
                        .cloned()
                        .unwrap_or(Scalar::Null(NullKind::Null))
                })
                .collect::<Vec<_>>();
            let column = match dtype_of(&name) {
                Some(dtype) => Column::new(dtype, values)?,
                None => Column::from_values(values)?,
            };
            columns.insert(name, column);
        }

        let mut frame = Self::new(columns)?;
        frame.len = rows.len();
        Ok(frame)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, Column> {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn require_column(&self, name: &str) -> Result<&Column, FrameError> {
        self.column(name)
            .ok_or_else(|| FrameError::UnknownColumn(name.to_owned()))
    }

    /// The record at `idx`, with every column present.
    #[must_use]
    pub fn row(&self, idx: usize) -> Option<Row> {
        if idx >= self.len {
            return None;
        }
        Some(
            self.columns
                .iter()
                .filter_map(|(name, column)| {
                    column.value(idx).map(|value| (name.clone(), value.clone()))
                })
                .collect(),
        )
    }

    #[must_use]
    pub fn to_rows(&self) -> Vec<Row> {
        (0..self.len).filter_map(|idx| self.row(idx)).collect()
    }

    /// Insert or overwrite a column.
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self, FrameError> {
        let name = name.into();
        let only_column = self.columns.is_empty()
            || (self.columns.len() == 1 && self.columns.contains_key(&name));
        if column.len() != self.len && !(only_column && self.len == 0) {
            return Err(FrameError::LengthMismatch {
                column: name,
                frame_len: self.len,
                column_len: column.len(),
            });
        }
        self.len = column.len();
        self.columns.insert(name, column);
        Ok(self)
    }

    /// Keep only the named columns that exist.
    #[must_use]
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let columns = names
            .iter()
            .filter_map(|name| {
                self.columns
                    .get_key_value(name.as_ref())
                    .map(|(key, column)| (key.clone(), column.clone()))
            })
            .collect();
        Self {
            len: self.len,
            columns,
        }
    }

    #[must_use]
    pub fn drop_columns<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let mut columns = self.columns.clone();
        for name in names {
            columns.remove(name.as_ref());
        }
        Self {
            len: self.len,
            columns,
        }
    }

    pub fn filter_rows(&self, mask: &[bool]) -> Result<Self, FrameError> {
        let mut columns = BTreeMap::new();
        for (name, column) in &self.columns {
            columns.insert(name.clone(), column.filter(mask)?);
        }
        Ok(Self {
            len: mask.iter().filter(|keep| **keep).count(),
            columns,
        })
    }

    /// Gather rows by position; `None` yields a row of missing values.
    pub fn take(&self, positions: &[Option<usize>]) -> Result<Self, FrameError> {
        let mut columns = BTreeMap::new();
        for (name, column) in &self.columns {
            columns.insert(name.clone(), column.reindex_by_positions(positions)?);
        }
        Ok(Self {
            len: positions.len(),
            columns,
        })
    }

    /// Stack frames vertically over the union of their columns.
    pub fn concat(frames: &[&Self]) -> Result<Self, FrameError> {
        let names = frames
            .iter()
            .flat_map(|frame| frame.columns.keys().cloned())
            .collect::<BTreeSet<_>>();

        let mut columns = BTreeMap::new();
        for name in names {
            let dtype = frames
                .iter()
                .find_map(|frame| frame.column(&name).map(Column::dtype))
                .unwrap_or(DType::Null);
            let padded = frames
                .iter()
                .map(|frame| {
                    frame
                        .column(&name)
                        .cloned()
                        .unwrap_or_else(|| Column::missing(dtype, frame.len))
                })
                .collect::<Vec<_>>();
            let parts = padded.iter().collect::<Vec<_>>();
            columns.insert(name, Column::concat(&parts)?);
        }

        Ok(Self {
            len: frames.iter().map(|frame| frame.len).sum(),
            columns,
        })
    }
}
