#![forbid(unsafe_code)]

mod store;

use std::collections::BTreeMap;

use cf_columnar::Column;
use cf_expr::ColumnLookup;
use cf_frame::{DataFrame, FrameError};
use cf_groupby::AggregationKind;
use cf_types::{DType, Scalar, cast_scalar_owned};
use serde::{Deserialize, Serialize};

pub use store::{Claim, DatasetStore, InMemoryStore, StoreError};

/// Reserved per-row identifier, carried through unchanged.
pub const ID_COLUMN: &str = "_id";
/// Reserved tag naming the dataset a propagated row came from.
pub const PARENT_COLUMN: &str = "parent_dataset_id";

pub type DatasetId = String;

#[must_use]
pub fn is_reserved_column(name: &str) -> bool {
    name == ID_COLUMN || name == PARENT_COLUMN
}

/// Internal column identifier for a display label: lowercase ASCII
/// alphanumerics with every other run of characters collapsed to `_`.
#[must_use]
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for c in label.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let trimmed = slug.trim_end_matches('_');
    if trimmed.is_empty() {
        "_".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub label: String,
    pub dtype: DType,
}

/// Column slugs of a dataset with their labels and declared dtypes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: BTreeMap<String, SchemaColumn>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare columns by label; slugs are derived with [`slugify`].
    #[must_use]
    pub fn from_labels(labels: &[(&str, DType)]) -> Self {
        let mut schema = Self::new();
        for (label, dtype) in labels {
            schema.ensure_column(slugify(label), *label, *dtype);
        }
        schema
    }

    /// A schema naming each non-reserved column of `frame` after itself.
    #[must_use]
    pub fn from_frame(frame: &DataFrame) -> Self {
        let mut schema = Self::new();
        schema.extend_from_frame(frame);
        schema
    }

    pub fn extend_from_frame(&mut self, frame: &DataFrame) {
        for (name, column) in frame.columns() {
            if !is_reserved_column(name) {
                self.ensure_column(name.clone(), name.as_str(), column.dtype());
            }
        }
    }

    /// Add a column unless the slug is already declared.
    pub fn ensure_column(&mut self, slug: impl Into<String>, label: &str, dtype: DType) {
        self.columns
            .entry(slug.into())
            .or_insert_with(|| SchemaColumn {
                label: label.to_owned(),
                dtype,
            });
    }

    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, SchemaColumn> {
        &self.columns
    }

    #[must_use]
    pub fn contains(&self, slug: &str) -> bool {
        self.columns.contains_key(slug)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn dtype(&self, slug: &str) -> Option<DType> {
        self.columns.get(slug).map(|column| column.dtype)
    }

    #[must_use]
    pub fn labels_to_slugs(&self) -> BTreeMap<String, String> {
        self.columns
            .iter()
            .map(|(slug, column)| (column.label.clone(), slug.clone()))
            .collect()
    }

    /// The slug `key` names, whether `key` is a label or already a slug.
    #[must_use]
    pub fn slug_for(&self, key: &str) -> Option<String> {
        if self.contains(key) {
            return Some(key.to_owned());
        }
        self.columns
            .iter()
            .find(|(_, column)| column.label == key)
            .map(|(slug, _)| slug.clone())
    }

    /// Coerce `value` to the declared dtype of `slug`.
    ///
    /// Undeclared columns pass through. Values that cannot be read as the
    /// declared dtype become missing.
    #[must_use]
    pub fn convert_type(&self, slug: &str, value: Scalar) -> Scalar {
        match self.dtype(slug) {
            None | Some(DType::Null) => value,
            Some(dtype) => cast_scalar_owned(value, dtype)
                .unwrap_or_else(|_| Scalar::missing_for_dtype(dtype)),
        }
    }
}

impl ColumnLookup for Schema {
    fn has_column(&self, name: &str) -> bool {
        self.contains(name)
    }

    fn is_empty(&self) -> bool {
        Schema::is_empty(self)
    }
}

/// A stored formula bound to a target column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calculation {
    pub name: String,
    pub formula: String,
    pub aggregation: Option<AggregationKind>,
    pub groups: Vec<String>,
}

impl Calculation {
    #[must_use]
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
            aggregation: None,
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn aggregate(
        name: impl Into<String>,
        formula: impl Into<String>,
        aggregation: AggregationKind,
        groups: Vec<String>,
    ) -> Self {
        Self {
            aggregation: Some(aggregation),
            groups,
            ..Self::new(name, formula)
        }
    }

    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        self.aggregation.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationFilter {
    All,
    NonAggregate,
    Aggregate,
}

/// An aggregated dataset derived from this one for a group tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedLink {
    pub groups: Vec<String>,
    pub dataset_id: DatasetId,
}

/// A child built by stacking rows of several parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedLink {
    pub child_id: DatasetId,
    /// Renames applied to this parent's columns inside the child.
    pub column_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinLink {
    /// Which side of the join this dataset is.
    pub side: JoinSide,
    pub other_id: DatasetId,
    pub on: String,
    pub joined_id: DatasetId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub count: usize,
    pub missing: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ColumnSummary {
    fn of(column: &Column) -> Self {
        let count = column.validity().count_valid();
        let numeric = column
            .values()
            .iter()
            .filter(|value| !value.is_missing())
            .filter_map(|value| value.to_f64().ok())
            .collect::<Vec<_>>();
        Self {
            count,
            missing: column.len() - count,
            min: numeric.iter().copied().reduce(f64::min),
            max: numeric.iter().copied().reduce(f64::max),
        }
    }
}

/// A table with its schema, calculations and relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    id: DatasetId,
    schema: Schema,
    frame: DataFrame,
    calculations: Vec<Calculation>,
    aggregated: Vec<AggregatedLink>,
    merged: Vec<MergedLink>,
    merge_parents: Vec<DatasetId>,
    joins: Vec<JoinLink>,
    ready: bool,
    #[serde(skip)]
    summary: Option<BTreeMap<String, ColumnSummary>>,
}

impl Dataset {
    #[must_use]
    pub fn new(id: impl Into<DatasetId>) -> Self {
        Self {
            id: id.into(),
            schema: Schema::new(),
            frame: DataFrame::empty(),
            calculations: Vec::new(),
            aggregated: Vec::new(),
            merged: Vec::new(),
            merge_parents: Vec::new(),
            joins: Vec::new(),
            ready: true,
            summary: None,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// A dataset holding `frame`, with a schema inferred from it.
    #[must_use]
    pub fn with_frame(id: impl Into<DatasetId>, frame: DataFrame) -> Self {
        let mut dataset = Self::new(id);
        dataset.schema = Schema::from_frame(&frame);
        dataset.frame = frame;
        dataset
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut Schema {
        &mut self.schema
    }

    /// Every stored row, reserved columns included.
    #[must_use]
    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    /// Stored rows without the parent tag, optionally narrowed to `select`.
    #[must_use]
    pub fn dframe(&self, select: Option<&[String]>) -> DataFrame {
        let frame = self.frame.drop_columns(&[PARENT_COLUMN]);
        match select {
            Some(names) => frame.select(names),
            None => frame,
        }
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.frame.len()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Append rows, declaring any new non-reserved columns in the schema.
    pub fn append_observations(&mut self, rows: &DataFrame) -> Result<(), FrameError> {
        self.frame = if self.frame.columns().is_empty() {
            rows.clone()
        } else {
            DataFrame::concat(&[&self.frame, rows])?
        };
        self.schema.extend_from_frame(rows);
        self.clear_summary_stats();
        Ok(())
    }

    /// Replace every stored row.
    pub fn replace_observations(&mut self, rows: DataFrame) {
        self.schema.extend_from_frame(&rows);
        self.frame = rows;
        self.clear_summary_stats();
    }

    /// Drop rows previously copied in from `parent_id`.
    pub fn remove_parent_observations(&mut self, parent_id: &str) -> Result<usize, FrameError> {
        let Some(tags) = self.frame.column(PARENT_COLUMN) else {
            return Ok(0);
        };
        let keep = tags
            .values()
            .iter()
            .map(|tag| !matches!(tag, Scalar::Utf8(id) if id == parent_id))
            .collect::<Vec<_>>();
        let removed = keep.iter().filter(|kept| !**kept).count();
        if removed > 0 {
            self.frame = self.frame.filter_rows(&keep)?;
            self.clear_summary_stats();
        }
        Ok(removed)
    }

    /// Per-column counts and numeric range, cached until the rows change.
    pub fn summary_stats(&mut self) -> &BTreeMap<String, ColumnSummary> {
        let frame = &self.frame;
        self.summary.get_or_insert_with(|| {
            frame
                .columns()
                .iter()
                .filter(|(name, _)| !is_reserved_column(name))
                .map(|(name, column)| (name.clone(), ColumnSummary::of(column)))
                .collect()
        })
    }

    #[must_use]
    pub fn has_cached_summary(&self) -> bool {
        self.summary.is_some()
    }

    pub fn clear_summary_stats(&mut self) {
        self.summary = None;
    }

    pub fn calculations(&self, filter: CalculationFilter) -> impl Iterator<Item = &Calculation> {
        self.calculations
            .iter()
            .filter(move |calculation| match filter {
                CalculationFilter::All => true,
                CalculationFilter::NonAggregate => !calculation.is_aggregate(),
                CalculationFilter::Aggregate => calculation.is_aggregate(),
            })
    }

    #[must_use]
    pub fn calculation(&self, name: &str) -> Option<&Calculation> {
        self.calculations.iter().find(|calc| calc.name == name)
    }

    /// Store `calculation`, replacing any definition with the same name.
    pub fn put_calculation(&mut self, calculation: Calculation) {
        self.calculations.retain(|calc| calc.name != calculation.name);
        self.calculations.push(calculation);
    }

    #[must_use]
    pub fn aggregated_datasets(&self) -> &[AggregatedLink] {
        &self.aggregated
    }

    #[must_use]
    pub fn aggregated_dataset_for(&self, groups: &[String]) -> Option<&str> {
        self.aggregated
            .iter()
            .find(|link| link.groups == groups)
            .map(|link| link.dataset_id.as_str())
    }

    pub fn add_aggregated_dataset(&mut self, groups: Vec<String>, dataset_id: impl Into<DatasetId>) {
        self.aggregated.push(AggregatedLink {
            groups,
            dataset_id: dataset_id.into(),
        });
    }

    #[must_use]
    pub fn merged_datasets(&self) -> &[MergedLink] {
        &self.merged
    }

    pub fn add_merged_dataset(&mut self, link: MergedLink) {
        self.merged.retain(|existing| existing.child_id != link.child_id);
        self.merged.push(link);
    }

    #[must_use]
    pub fn merge_parents(&self) -> &[DatasetId] {
        &self.merge_parents
    }

    pub fn set_merge_parents(&mut self, parents: Vec<DatasetId>) {
        self.merge_parents = parents;
    }

    #[must_use]
    pub fn joined_datasets(&self) -> &[JoinLink] {
        &self.joins
    }

    pub fn add_join(&mut self, link: JoinLink) {
        self.joins.push(link);
    }

    /// Join keys this dataset supplies as the right-hand side.
    pub fn on_columns_for_rhs_of_joins(&self) -> impl Iterator<Item = &str> {
        self.joins
            .iter()
            .filter(|link| link.side == JoinSide::Right)
            .map(|link| link.on.as_str())
    }
}
