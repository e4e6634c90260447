#![forbid(unsafe_code)]

//! Keeps derived datasets consistent as rows are appended.
//!
//! Every change travels as a [`Message`]. The [`Calculator`] applies one
//! message while holding the target dataset's update lease and answers with
//! the follow-up messages for its descendants; an [`UpdateQueue`] drives
//! that loop, retrying deferred messages after the policy's delay.

mod calculator;
mod log;
mod message;
mod queue;
mod relations;

use cf_columnar::ColumnError;
use cf_dataset::StoreError;
use cf_expr::ExprError;
use cf_frame::FrameError;
use cf_groupby::AggregationError;
use cf_join::JoinError;
use thiserror::Error;

pub use calculator::Calculator;
pub use message::{Message, UpdateOutcome, UpdateRequest};
pub use queue::UpdateQueue;
pub use relations::{aggregated_dataset_id, join_datasets, merge_datasets};

#[derive(Debug, Error)]
pub enum CalcError {
    #[error("dataset {dataset_id:?} already has a column or calculation named {name:?}")]
    NameCollision { dataset_id: String, name: String },
    #[error("unknown calculation: {0}")]
    UnknownCalculation(String),
    #[error("group column {0:?} is not in the schema")]
    UnknownGroupColumn(String),
    #[error("formula {0:?} does not aggregate, so it cannot be grouped")]
    GroupsWithoutAggregation(String),
    #[error("a merged dataset needs at least one parent")]
    MergeWithoutParents,
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}
