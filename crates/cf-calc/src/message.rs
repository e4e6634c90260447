use std::time::Duration;

use cf_dataset::{Claim, DatasetId};
use cf_frame::Row;
use cf_runtime::UpdateId;
use serde::{Deserialize, Serialize};

/// New rows for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub dataset_id: DatasetId,
    /// Records keyed by column label or slug.
    pub rows: Vec<Row>,
    /// Set when the rows were propagated from another dataset; appended rows
    /// are tagged with it.
    pub parent_id: Option<DatasetId>,
    pub update_id: UpdateId,
    /// Drop rows previously tagged with `parent_id` before appending.
    pub replace_parent_rows: bool,
}

impl UpdateRequest {
    #[must_use]
    pub fn new(dataset_id: impl Into<DatasetId>, rows: Vec<Row>, update_id: UpdateId) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            rows,
            parent_id: None,
            update_id,
            replace_parent_rows: false,
        }
    }

    #[must_use]
    pub fn from_parent(mut self, parent_id: impl Into<DatasetId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn replacing_parent_rows(mut self) -> Self {
        self.replace_parent_rows = true;
        self
    }
}

/// A unit of work against a single dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Update(UpdateRequest),
    /// Compute the named stored calculations over the whole table.
    CalculateColumns {
        dataset_id: DatasetId,
        calculations: Vec<String>,
        update_id: UpdateId,
    },
    /// Refresh the rows `dataset_id` holds from `parent_id`.
    PropagateColumn {
        dataset_id: DatasetId,
        parent_id: DatasetId,
        update_id: UpdateId,
    },
}

impl Message {
    #[must_use]
    pub fn dataset_id(&self) -> &str {
        match self {
            Self::Update(request) => &request.dataset_id,
            Self::CalculateColumns { dataset_id, .. } | Self::PropagateColumn { dataset_id, .. } => {
                dataset_id
            }
        }
    }

    #[must_use]
    pub fn update_id(&self) -> UpdateId {
        match self {
            Self::Update(request) => request.update_id,
            Self::CalculateColumns { update_id, .. } | Self::PropagateColumn { update_id, .. } => {
                *update_id
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::CalculateColumns { .. } => "calculate_columns",
            Self::PropagateColumn { .. } => "propagate_column",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The message was applied; `follow_ups` carry the change onward.
    Applied { follow_ups: Vec<Message> },
    /// The dataset was busy. Nothing changed; try again after `retry_after`.
    Deferred { claim: Claim, retry_after: Duration },
}
