use std::collections::BTreeMap;

use cf_columnar::Column;
use cf_dataset::{
    Dataset, DatasetId, DatasetStore, ID_COLUMN, JoinLink, JoinSide, MergedLink, PARENT_COLUMN,
};
use cf_frame::DataFrame;
use cf_join::{JoinError, JoinType, join_frames};
use cf_types::{DType, Scalar};

use crate::CalcError;
use crate::log::info;

/// Id of the dataset holding `dataset_id`'s aggregations over `groups`.
#[must_use]
pub fn aggregated_dataset_id(dataset_id: &str, groups: &[String]) -> DatasetId {
    format!("{dataset_id}:{}", groups.join(","))
}

/// Build `child_id` by stacking the rows of `parents`.
///
/// Each parent comes with a map renaming its columns inside the child. The
/// child's rows are tagged with the parent they came from and every parent
/// records the link so later appends flow down.
pub fn merge_datasets<S: DatasetStore>(
    store: &S,
    child_id: &str,
    parents: &[(DatasetId, BTreeMap<String, String>)],
) -> Result<Dataset, CalcError> {
    if parents.is_empty() {
        return Err(CalcError::MergeWithoutParents);
    }

    let mut child = Dataset::new(child_id);
    let mut parts = Vec::with_capacity(parents.len());
    for (parent_id, column_map) in parents {
        let mut parent = store.get(parent_id)?;
        for (slug, column) in parent.schema().columns() {
            let target = column_map.get(slug).unwrap_or(slug);
            child
                .schema_mut()
                .ensure_column(target.clone(), &column.label, column.dtype);
        }
        let rows = rename_columns(&parent.dframe(None), column_map)?;
        parts.push(tag_parent(rows, parent_id)?);

        parent.add_merged_dataset(MergedLink {
            child_id: child_id.to_owned(),
            column_map: column_map.clone(),
        });
        store.put(parent)?;
    }

    let stacked = DataFrame::concat(&parts.iter().collect::<Vec<_>>())?;
    child.replace_observations(stacked);
    child.set_merge_parents(parents.iter().map(|(id, _)| id.clone()).collect());
    store.put(child.clone())?;

    info!(
        dataset = child_id,
        parents = parents.len(),
        rows = child.num_rows(),
        "merged dataset built"
    );
    Ok(child)
}

/// Build `joined_id` as the left join of `left_id` with `right_id` on `on`.
///
/// The right side's key must be unique. Both sides record the link: appends
/// to the left rebuild the joined dataset, appends to the right flow in as
/// new joined rows.
pub fn join_datasets<S: DatasetStore>(
    store: &S,
    joined_id: &str,
    left_id: &str,
    right_id: &str,
    on: &str,
) -> Result<Dataset, CalcError> {
    let mut left = store.get(left_id)?;
    let mut right = store.get(right_id)?;
    if !left.schema().contains(on) && !left.frame().has_column(on) {
        return Err(JoinError::UnknownJoinColumn(on.to_owned()).into());
    }

    let right_rows = strip_reserved(&right.dframe(None));
    if right_rows.column(on).is_some_and(Column::has_duplicates) {
        return Err(JoinError::NonUniqueJoin {
            column: on.to_owned(),
        }
        .into());
    }
    let rows = join_frames(&left.dframe(None), &right_rows, on, JoinType::Left)?;

    let mut schema = left.schema().clone();
    for (slug, column) in right.schema().columns() {
        schema.ensure_column(slug.clone(), &column.label, column.dtype);
    }
    let mut joined = Dataset::new(joined_id).with_schema(schema);
    joined.replace_observations(rows);

    left.add_join(JoinLink {
        side: JoinSide::Left,
        other_id: right_id.to_owned(),
        on: on.to_owned(),
        joined_id: joined_id.to_owned(),
    });
    right.add_join(JoinLink {
        side: JoinSide::Right,
        other_id: left_id.to_owned(),
        on: on.to_owned(),
        joined_id: joined_id.to_owned(),
    });
    store.put(left)?;
    store.put(right)?;
    store.put(joined.clone())?;

    info!(
        dataset = joined_id,
        left = left_id,
        right = right_id,
        on,
        rows = joined.num_rows(),
        "joined dataset built"
    );
    Ok(joined)
}

pub(crate) fn rename_columns(
    frame: &DataFrame,
    column_map: &BTreeMap<String, String>,
) -> Result<DataFrame, CalcError> {
    if column_map.is_empty() {
        return Ok(frame.clone());
    }
    let columns = frame
        .columns()
        .iter()
        .map(|(name, column)| {
            let target = column_map.get(name).unwrap_or(name);
            (target.clone(), column.clone())
        })
        .collect::<BTreeMap<_, _>>();
    Ok(DataFrame::new(columns)?)
}

pub(crate) fn tag_parent(frame: DataFrame, parent_id: &str) -> Result<DataFrame, CalcError> {
    let tags = Column::new(
        DType::Utf8,
        vec![Scalar::Utf8(parent_id.to_owned()); frame.len()],
    )?;
    Ok(frame.with_column(PARENT_COLUMN, tags)?)
}

pub(crate) fn strip_reserved(frame: &DataFrame) -> DataFrame {
    frame.drop_columns(&[ID_COLUMN, PARENT_COLUMN])
}
