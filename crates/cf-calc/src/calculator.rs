use std::sync::atomic::{AtomicU64, Ordering};

use cf_columnar::Column;
use cf_dataset::{
    Calculation, CalculationFilter, Dataset, DatasetStore, ID_COLUMN, JoinLink, JoinSide,
    PARENT_COLUMN, is_reserved_column,
};
use cf_expr::{ParsedFormula, evaluate_column, parse_formula, validate_formula};
use cf_frame::{DataFrame, Row};
use cf_groupby::{AggregationKind, compute_full, merge_on_groups, reduce};
use cf_join::{JoinType, check_unique_join_column, join_frames, keys_intersect};
use cf_runtime::{UpdateId, UpdatePolicy};
use cf_types::DType;

use crate::log::{debug, info, warn};
use crate::relations::{aggregated_dataset_id, rename_columns, strip_reserved, tag_parent};
use crate::{CalcError, Message, UpdateOutcome, UpdateRequest};

/// Applies messages against a [`DatasetStore`].
#[derive(Debug)]
pub struct Calculator<S> {
    store: S,
    policy: UpdatePolicy,
    last_update_id: AtomicU64,
}

impl<S: DatasetStore> Calculator<S> {
    pub fn new(store: S, policy: UpdatePolicy) -> Self {
        Self {
            store,
            policy,
            last_update_id: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn policy(&self) -> &UpdatePolicy {
        &self.policy
    }

    /// Issue a fresh id. Ids grow with issue order.
    pub fn next_update_id(&self) -> UpdateId {
        UpdateId(self.last_update_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Apply one message under the target dataset's update lease.
    pub fn process(&self, message: &Message) -> Result<UpdateOutcome, CalcError> {
        match message {
            Message::Update(request) => self.calculate_updates(request),
            Message::CalculateColumns {
                dataset_id,
                calculations,
                update_id,
            } => self.guarded(dataset_id, *update_id, || {
                let dataset = self.store.get(dataset_id)?;
                let calculations = calculations
                    .iter()
                    .map(|name| {
                        dataset
                            .calculation(name)
                            .cloned()
                            .ok_or_else(|| CalcError::UnknownCalculation(name.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.calculate_columns(dataset_id, &calculations)
            }),
            Message::PropagateColumn {
                dataset_id,
                parent_id,
                update_id,
            } => self.guarded(dataset_id, *update_id, || {
                self.propagate_column(dataset_id, parent_id)
            }),
        }
    }

    /// Append `request.rows` and compute what has to change downstream.
    ///
    /// Returns [`UpdateOutcome::Deferred`] without touching the dataset when
    /// it is not ready, an earlier update is pending, or another update holds
    /// the lease.
    pub fn calculate_updates(&self, request: &UpdateRequest) -> Result<UpdateOutcome, CalcError> {
        self.guarded(&request.dataset_id, request.update_id, || {
            self.apply_update(request)
        })
    }

    fn guarded(
        &self,
        dataset_id: &str,
        update_id: UpdateId,
        body: impl FnOnce() -> Result<Vec<Message>, CalcError>,
    ) -> Result<UpdateOutcome, CalcError> {
        let claim = self
            .store
            .try_claim(dataset_id, update_id, self.policy.lease_ttl())?;
        if !claim.is_granted() {
            debug!(dataset = dataset_id, %update_id, ?claim, "update deferred");
            return Ok(UpdateOutcome::Deferred {
                claim,
                retry_after: self.policy.retry_delay(),
            });
        }

        let result = body();
        let released = self.store.release(dataset_id, update_id);
        let follow_ups = result?;
        released?;
        Ok(UpdateOutcome::Applied { follow_ups })
    }

    fn apply_update(&self, request: &UpdateRequest) -> Result<Vec<Message>, CalcError> {
        let mut dataset = self.store.get(&request.dataset_id)?;

        let mut removed = 0;
        if request.replace_parent_rows
            && let Some(parent_id) = &request.parent_id
        {
            removed = dataset.remove_parent_observations(parent_id)?;
        }

        let raw = normalize_rows(&dataset, &request.rows)?;
        if raw.is_empty() {
            if removed > 0 {
                self.store.put(dataset)?;
            }
            debug!(dataset = %request.dataset_id, removed, "no rows to append");
            return Ok(Vec::new());
        }

        for on in dataset.on_columns_for_rhs_of_joins() {
            check_unique_join_column(on, dataset.frame(), &raw)?;
        }

        let mut rows = add_calculations(&dataset, pad_schema_columns(&dataset, raw.clone())?)?;
        if let Some(parent_id) = &request.parent_id {
            rows = tag_parent(rows, parent_id)?;
        }

        dataset.append_observations(&rows)?;
        self.store.put(dataset.clone())?;
        info!(
            dataset = %request.dataset_id,
            update_id = %request.update_id,
            rows = rows.len(),
            removed,
            "rows appended"
        );

        // Stored accumulators still count the rows that were just replaced.
        let reducible = removed == 0;
        Ok(self.propagate(&dataset, &raw, &rows, reducible))
    }

    /// Follow-up work for `dataset`'s descendants after `rows` were appended.
    ///
    /// `raw` holds the normalized rows as received, `rows` the same rows with
    /// calculated columns. Aggregations are updated in place; merged and
    /// joined children get messages. A failing descendant is logged and
    /// skipped.
    pub fn propagate(
        &self,
        dataset: &Dataset,
        raw: &DataFrame,
        rows: &DataFrame,
        reducible: bool,
    ) -> Vec<Message> {
        let mut follow_ups = Vec::new();

        for calculation in dataset.calculations(CalculationFilter::Aggregate) {
            match self.update_aggregation(dataset, calculation, rows, reducible) {
                Ok(messages) => follow_ups.extend(messages),
                Err(err) => warn!(
                    dataset = dataset.id(),
                    calculation = %calculation.name,
                    error = %err,
                    "aggregation not updated"
                ),
            }
        }

        let propagated = rows.drop_columns(&[PARENT_COLUMN]);
        for link in dataset.merged_datasets() {
            match rename_columns(&propagated, &link.column_map) {
                Ok(renamed) => follow_ups.push(Message::Update(
                    UpdateRequest::new(&link.child_id, renamed.to_rows(), self.next_update_id())
                        .from_parent(dataset.id()),
                )),
                Err(err) => warn!(
                    dataset = dataset.id(),
                    child = %link.child_id,
                    error = %err,
                    "merged rows not propagated"
                ),
            }
        }

        for link in dataset.joined_datasets() {
            match self.update_join(dataset, link, raw) {
                Ok(message) => follow_ups.extend(message),
                Err(err) => warn!(
                    dataset = dataset.id(),
                    joined = %link.joined_id,
                    error = %err,
                    "joined dataset not updated"
                ),
            }
        }

        debug!(dataset = dataset.id(), follow_ups = follow_ups.len(), "propagated");
        follow_ups
    }

    fn update_aggregation(
        &self,
        dataset: &Dataset,
        calculation: &Calculation,
        rows: &DataFrame,
        reducible: bool,
    ) -> Result<Vec<Message>, CalcError> {
        let Some(kind) = calculation.aggregation else {
            return Ok(Vec::new());
        };
        let Some(aggregated_id) = dataset.aggregated_dataset_for(&calculation.groups) else {
            return Ok(Vec::new());
        };
        let mut aggregated = self.store.get(aggregated_id)?;
        let parsed = parse_formula(&calculation.formula)?;
        let existing = aggregated.dframe(None);

        let updated = if reducible && kind.is_reducible() {
            let arguments = evaluate_arguments(&parsed, rows)?;
            reduce(
                kind,
                &calculation.name,
                &calculation.groups,
                &existing,
                rows,
                &arguments,
            )?
        } else {
            let full = dataset.dframe(None);
            let result = aggregate_frame(kind, calculation, &parsed, &full)?;
            merge_on_groups(&existing, &result, &calculation.groups)?
        };

        // Written without the aggregated dataset's lease: a concurrent
        // writer to it between the get and this put loses its change.
        aggregated.replace_observations(updated);
        self.store.put(aggregated.clone())?;
        debug!(
            dataset = aggregated_id,
            calculation = %calculation.name,
            incremental = reducible && kind.is_reducible(),
            "aggregation updated"
        );
        Ok(self.refresh_aggregated_children(&aggregated))
    }

    fn update_join(
        &self,
        dataset: &Dataset,
        link: &JoinLink,
        raw: &DataFrame,
    ) -> Result<Option<Message>, CalcError> {
        match link.side {
            JoinSide::Left => {
                let Some(keys) = raw.column(&link.on) else {
                    return Ok(None);
                };
                let right = strip_reserved(&self.store.get(&link.other_id)?.dframe(None));
                let Some(right_keys) = right.column(&link.on) else {
                    return Ok(None);
                };
                if !keys_intersect(keys, right_keys) {
                    return Ok(None);
                }

                // Rebuilt wholesale; the joined dataset's own descendants are
                // not notified on this path. The joined dataset's lease is not
                // taken, so an update applied to it concurrently is overwritten.
                let rows = join_frames(&dataset.dframe(None), &right, &link.on, JoinType::Left)?;
                let mut joined = self.store.get(&link.joined_id)?;
                joined.replace_observations(rows);
                self.store.put(joined)?;
                info!(dataset = %link.joined_id, "joined dataset rebuilt");
                Ok(None)
            }
            JoinSide::Right => {
                let incoming = strip_reserved(raw);
                let rows = if incoming.has_column(&link.on) {
                    let left = self.store.get(&link.other_id)?.dframe(None);
                    join_frames(&incoming, &left, &link.on, JoinType::Left)?
                } else {
                    incoming
                };
                Ok(Some(Message::Update(
                    UpdateRequest::new(&link.joined_id, rows.to_rows(), self.next_update_id())
                        .from_parent(dataset.id()),
                )))
            }
        }
    }

    fn refresh_aggregated_children(&self, aggregated: &Dataset) -> Vec<Message> {
        let rows = aggregated.dframe(None);
        aggregated
            .merged_datasets()
            .iter()
            .filter_map(|link| match rename_columns(&rows, &link.column_map) {
                Ok(renamed) => Some(Message::Update(
                    UpdateRequest::new(&link.child_id, renamed.to_rows(), self.next_update_id())
                        .from_parent(aggregated.id())
                        .replacing_parent_rows(),
                )),
                Err(err) => {
                    warn!(child = %link.child_id, error = %err, "aggregated rows not propagated");
                    None
                }
            })
            .collect()
    }

    /// Compute `calculations` over every stored row of `dataset_id`.
    ///
    /// Row-wise formulas add or overwrite a column in place. Aggregations
    /// fill the aggregated dataset for their groups, creating and linking it
    /// the first time. Merged children are asked to pick up the new columns.
    pub fn calculate_columns(
        &self,
        dataset_id: &str,
        calculations: &[Calculation],
    ) -> Result<Vec<Message>, CalcError> {
        let mut dataset = self.store.get(dataset_id)?;
        let mut frame = pad_schema_columns(&dataset, dataset.frame().clone())?;
        let mut changed = false;
        let mut follow_ups = Vec::new();

        for calculation in calculations {
            let parsed = parse_formula(&calculation.formula)?;
            match parsed.aggregation {
                None => {
                    let column = evaluate_column(&parsed.expressions[0], &frame)?;
                    frame = frame.with_column(calculation.name.clone(), column)?;
                    changed = true;
                }
                Some(kind) => {
                    follow_ups.extend(self.build_aggregation(
                        &mut dataset,
                        calculation,
                        kind,
                        &parsed,
                        &frame,
                    )?);
                }
            }
        }

        if changed {
            dataset.replace_observations(frame);
        }
        self.store.put(dataset.clone())?;
        info!(
            dataset = dataset_id,
            calculations = calculations.len(),
            "columns calculated"
        );

        follow_ups.extend(dataset.merged_datasets().iter().map(|link| {
            Message::PropagateColumn {
                dataset_id: link.child_id.clone(),
                parent_id: dataset_id.to_owned(),
                update_id: self.next_update_id(),
            }
        }));
        Ok(follow_ups)
    }

    fn build_aggregation(
        &self,
        dataset: &mut Dataset,
        calculation: &Calculation,
        kind: AggregationKind,
        parsed: &ParsedFormula,
        frame: &DataFrame,
    ) -> Result<Vec<Message>, CalcError> {
        let aggregated_id = match dataset.aggregated_dataset_for(&calculation.groups) {
            Some(id) => id.to_owned(),
            None => {
                let id = aggregated_dataset_id(dataset.id(), &calculation.groups);
                dataset.add_aggregated_dataset(calculation.groups.clone(), id.clone());
                id
            }
        };
        let mut aggregated = if self.store.contains(&aggregated_id)? {
            self.store.get(&aggregated_id)?
        } else {
            Dataset::new(aggregated_id.clone())
        };

        let source = frame.drop_columns(&[PARENT_COLUMN]);
        let result = aggregate_frame(kind, calculation, parsed, &source)?;
        let merged = merge_on_groups(&aggregated.dframe(None), &result, &calculation.groups)?;
        aggregated.replace_observations(merged);
        self.store.put(aggregated.clone())?;
        info!(
            dataset = %aggregated_id,
            calculation = %calculation.name,
            groups = ?calculation.groups,
            "aggregated dataset built"
        );
        Ok(self.refresh_aggregated_children(&aggregated))
    }

    /// Refresh the rows `dataset_id` holds from its merge parent `parent_id`.
    pub fn propagate_column(
        &self,
        dataset_id: &str,
        parent_id: &str,
    ) -> Result<Vec<Message>, CalcError> {
        let mut child = self.store.get(dataset_id)?;
        let parent = self.store.get(parent_id)?;
        child.remove_parent_observations(parent_id)?;

        let column_map = parent
            .merged_datasets()
            .iter()
            .find(|link| link.child_id == dataset_id)
            .map(|link| link.column_map.clone())
            .unwrap_or_default();
        let parent_rows = tag_parent(rename_columns(&parent.dframe(None), &column_map)?, parent_id)?;
        let own_rows = child.frame().clone();
        let rows = if own_rows.columns().is_empty() {
            parent_rows
        } else {
            DataFrame::concat(&[&own_rows, &parent_rows])?
        };
        child.replace_observations(rows);
        self.store.put(child.clone())?;
        info!(dataset = dataset_id, parent = parent_id, "parent columns propagated");

        Ok(child
            .merged_datasets()
            .iter()
            .map(|link| Message::PropagateColumn {
                dataset_id: link.child_id.clone(),
                parent_id: dataset_id.to_owned(),
                update_id: self.next_update_id(),
            })
            .collect())
    }

    /// Validate and store a calculation, returning the message that fills it.
    ///
    /// Groups are only allowed for aggregations and must name schema
    /// columns. A name already used by a calculation, or by a column for
    /// row-wise formulas, is rejected unless `overwrite` is set.
    pub fn add_calculation(
        &self,
        dataset_id: &str,
        name: &str,
        formula: &str,
        groups: Vec<String>,
        overwrite: bool,
    ) -> Result<Message, CalcError> {
        let mut dataset = self.store.get(dataset_id)?;
        let aggregation = validate_formula(formula, Some(dataset.schema()))?;

        if aggregation.is_none() && !groups.is_empty() {
            return Err(CalcError::GroupsWithoutAggregation(formula.to_owned()));
        }
        if let Some(group) = groups.iter().find(|group| !dataset.schema().contains(group)) {
            return Err(CalcError::UnknownGroupColumn(group.clone()));
        }

        let taken = dataset.calculation(name).is_some()
            || is_reserved_column(name)
            || (aggregation.is_none() && dataset.schema().contains(name));
        if taken && !overwrite {
            return Err(CalcError::NameCollision {
                dataset_id: dataset_id.to_owned(),
                name: name.to_owned(),
            });
        }

        let calculation = match aggregation {
            Some(kind) => Calculation::aggregate(name, formula, kind, groups),
            None => Calculation::new(name, formula),
        };
        dataset.put_calculation(calculation);
        self.store.put(dataset)?;
        info!(dataset = dataset_id, calculation = name, "calculation added");

        Ok(Message::CalculateColumns {
            dataset_id: dataset_id.to_owned(),
            calculations: vec![name.to_owned()],
            update_id: self.next_update_id(),
        })
    }
}

/// Records keyed by slug, typed per the schema.
///
/// Labels are mapped to slugs and values coerced to the declared dtype.
/// `_id` passes through untouched, keys the schema does not know are
/// dropped. A dataset without a schema accepts every key.
fn normalize_rows(dataset: &Dataset, rows: &[Row]) -> Result<DataFrame, CalcError> {
    let schema = dataset.schema();
    let normalized = rows
        .iter()
        .map(|row| {
            row.iter()
                .filter(|(key, _)| key.as_str() != PARENT_COLUMN)
                .filter_map(|(key, value)| {
                    if key == ID_COLUMN || schema.is_empty() {
                        return Some((key.clone(), value.clone()));
                    }
                    let slug = schema.slug_for(key)?;
                    let value = schema.convert_type(&slug, value.clone());
                    Some((slug, value))
                })
                .collect::<Row>()
        })
        .collect::<Vec<_>>();

    Ok(DataFrame::from_rows_typed(&normalized, |name| {
        schema.dtype(name).filter(|dtype| *dtype != DType::Null)
    })?)
}

/// Declared columns absent from `rows`, added as missing so row-wise
/// formulas can reference them.
fn pad_schema_columns(dataset: &Dataset, mut rows: DataFrame) -> Result<DataFrame, CalcError> {
    let len = rows.len();
    for (slug, column) in dataset.schema().columns() {
        if !rows.has_column(slug) {
            rows = rows.with_column(slug.clone(), Column::missing(column.dtype, len))?;
        }
    }
    Ok(rows)
}

/// Evaluate every row-wise calculation over `rows`, in definition order so
/// later formulas can read earlier results.
fn add_calculations(dataset: &Dataset, mut rows: DataFrame) -> Result<DataFrame, CalcError> {
    for calculation in dataset.calculations(CalculationFilter::NonAggregate) {
        let parsed = parse_formula(&calculation.formula)?;
        let column = evaluate_column(&parsed.expressions[0], &rows)?;
        rows = rows.with_column(calculation.name.clone(), column)?;
    }
    Ok(rows)
}

fn evaluate_arguments(parsed: &ParsedFormula, frame: &DataFrame) -> Result<Vec<Column>, CalcError> {
    parsed
        .expressions
        .iter()
        .map(|expr| Ok(evaluate_column(expr, frame)?))
        .collect()
}

fn aggregate_frame(
    kind: AggregationKind,
    calculation: &Calculation,
    parsed: &ParsedFormula,
    frame: &DataFrame,
) -> Result<DataFrame, CalcError> {
    let arguments = evaluate_arguments(parsed, frame)?;
    Ok(compute_full(
        kind,
        &calculation.name,
        &calculation.groups,
        frame,
        &arguments,
    )?)
}
