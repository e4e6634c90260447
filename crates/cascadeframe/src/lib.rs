#![forbid(unsafe_code)]

//! Datasets whose derived columns and dependent datasets stay current as
//! rows arrive.
//!
//! ```
//! use cascadeframe::{Calculator, Dataset, DatasetStore, InMemoryStore, Schema, UpdatePolicy, UpdateQueue};
//! use cascadeframe::{DType, Row, Scalar};
//!
//! let store = InMemoryStore::new();
//! let schema = Schema::from_labels(&[("Region", DType::Utf8), ("Amount", DType::Float64)]);
//! store.put(Dataset::new("sales").with_schema(schema)).unwrap();
//!
//! let mut queue = UpdateQueue::new(Calculator::new(store, UpdatePolicy::immediate()));
//! let rows = vec![
//!     Row::from([("Region".to_owned(), Scalar::from("A")), ("Amount".to_owned(), Scalar::from(5.0))]),
//!     Row::from([("Region".to_owned(), Scalar::from("A")), ("Amount".to_owned(), Scalar::from(3.0))]),
//! ];
//! queue.submit_update("sales", rows).unwrap();
//! queue.add_calculation("sales", "total", "sum(amount)", vec!["region".to_owned()], false).unwrap();
//! queue.run_until_idle().unwrap();
//!
//! let totals = queue.calculator().store().get("sales:region").unwrap();
//! assert_eq!(totals.frame().column("total").unwrap().value(0), Some(&Scalar::Float64(8.0)));
//! ```

pub use cf_calc::{
    CalcError, Calculator, Message, UpdateOutcome, UpdateQueue, UpdateRequest,
    aggregated_dataset_id, join_datasets, merge_datasets,
};
pub use cf_columnar::{ArithmeticOp, Column, ColumnError, ComparisonOp};
pub use cf_dataset::{
    Calculation, CalculationFilter, Claim, ColumnSummary, Dataset, DatasetId, DatasetStore,
    ID_COLUMN, InMemoryStore, PARENT_COLUMN, Schema, SchemaColumn, StoreError, slugify,
};
pub use cf_expr::{
    Expr, ExprError, ParseError, ParsedFormula, parse_formula, reserved_words, validate_formula,
};
pub use cf_frame::{DataFrame, FrameError, Row};
pub use cf_groupby::{AggregationError, AggregationKind};
pub use cf_join::{JoinError, JoinType};
pub use cf_runtime::{
    DecisionAction, DecisionRecord, PropagationLedger, UpdateId, UpdatePolicy,
};
pub use cf_types::{DType, NullKind, Scalar};
