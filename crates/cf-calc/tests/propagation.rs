use std::collections::BTreeMap;
use std::time::Duration;

use cf_calc::{CalcError, Calculator, UpdateQueue, join_datasets, merge_datasets};
use cf_dataset::{Dataset, DatasetStore, InMemoryStore, PARENT_COLUMN, Schema};
use cf_frame::{DataFrame, Row};
use cf_runtime::{DecisionAction, UpdateId, UpdatePolicy};
use cf_types::{DType, Scalar};

fn row(pairs: &[(&str, Scalar)]) -> Row {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_owned(), value.clone()))
        .collect()
}

fn sale(region: &str, amount: f64) -> Row {
    row(&[
        ("Region", Scalar::Utf8(region.to_owned())),
        ("Amount", Scalar::Float64(amount)),
    ])
}

fn queue_with(datasets: Vec<Dataset>, policy: UpdatePolicy) -> UpdateQueue<InMemoryStore> {
    let store = InMemoryStore::new();
    for dataset in datasets {
        store.put(dataset).expect("put");
    }
    UpdateQueue::new(Calculator::new(store, policy))
}

fn sales_dataset(id: &str) -> Dataset {
    Dataset::new(id).with_schema(Schema::from_labels(&[
        ("Region", DType::Utf8),
        ("Amount", DType::Float64),
        ("Cost", DType::Float64),
    ]))
}

fn stored(queue: &UpdateQueue<InMemoryStore>, id: &str) -> Dataset {
    queue.calculator().store().get(id).expect("stored dataset")
}

fn float_at(frame: &DataFrame, column: &str, idx: usize) -> f64 {
    frame
        .column(column)
        .and_then(|column| column.value(idx))
        .and_then(|value| value.to_f64().ok())
        .expect("float value")
}

fn grouped_value(frame: &DataFrame, group: &str, key: &str, column: &str) -> f64 {
    let idx = frame
        .column(group)
        .expect("group column")
        .values()
        .iter()
        .position(|value| *value == Scalar::Utf8(key.to_owned()))
        .expect("group key");
    float_at(frame, column, idx)
}

#[test]
fn grouped_sum_is_built_then_kept_current() {
    let mut queue = queue_with(vec![sales_dataset("sales")], UpdatePolicy::immediate());
    queue
        .submit_update(
            "sales",
            vec![sale("A", 5.0), sale("B", 2.0), sale("A", 3.0)],
        )
        .expect("submit");
    queue.run_until_idle().expect("run");

    queue
        .add_calculation(
            "sales",
            "total",
            "sum(amount)",
            vec!["region".to_owned()],
            false,
        )
        .expect("add");
    queue.run_until_idle().expect("run");

    let aggregated = stored(&queue, "sales:region");
    assert_eq!(aggregated.num_rows(), 2);
    assert_eq!(grouped_value(aggregated.frame(), "region", "A", "total"), 8.0);
    assert_eq!(grouped_value(aggregated.frame(), "region", "B", "total"), 2.0);

    queue
        .submit_update("sales", vec![sale("A", 1.0), sale("C", 4.0)])
        .expect("submit");
    queue.run_until_idle().expect("run");

    let aggregated = stored(&queue, "sales:region");
    assert_eq!(aggregated.num_rows(), 3);
    assert_eq!(grouped_value(aggregated.frame(), "region", "A", "total"), 9.0);
    assert_eq!(grouped_value(aggregated.frame(), "region", "C", "total"), 4.0);
    assert_eq!(queue.ledger().count(DecisionAction::Rejected), 0);
}

#[test]
fn incremental_mean_uses_stored_accumulators() {
    let mut queue = queue_with(vec![sales_dataset("sales")], UpdatePolicy::immediate());
    queue
        .submit_update("sales", vec![sale("A", 10.0), sale("A", 6.0)])
        .expect("submit");
    queue
        .add_calculation("sales", "avg", "mean(amount)", Vec::new(), false)
        .expect("add");
    queue.run_until_idle().expect("run");

    let aggregated = stored(&queue, "sales:");
    assert_eq!(float_at(aggregated.frame(), "avg", 0), 8.0);

    queue
        .submit_update("sales", vec![sale("B", 10.0)])
        .expect("submit");
    queue.run_until_idle().expect("run");

    let aggregated = stored(&queue, "sales:");
    assert_eq!(aggregated.num_rows(), 1);
    assert!((float_at(aggregated.frame(), "avg", 0) - 26.0 / 3.0).abs() < 1e-12);
    assert_eq!(float_at(aggregated.frame(), "avg_numerator", 0), 26.0);
    assert_eq!(float_at(aggregated.frame(), "avg_denominator", 0), 3.0);
}

#[test]
fn incremental_ratio_matches_full_recompute() {
    let priced = |region: &str, amount: f64, cost: f64| {
        row(&[
            ("region", Scalar::Utf8(region.to_owned())),
            ("amount", Scalar::Float64(amount)),
            ("cost", Scalar::Float64(cost)),
        ])
    };
    let first = vec![priced("A", 4.0, 2.0), priced("B", 3.0, 1.0)];
    let second = vec![priced("A", 6.0, 3.0), priced("B", 1.0, 4.0), priced("C", 5.0, 5.0)];

    let mut queue = queue_with(
        vec![sales_dataset("incremental"), sales_dataset("full")],
        UpdatePolicy::immediate(),
    );
    let groups = vec!["region".to_owned()];

    queue.submit_update("incremental", first.clone()).expect("submit");
    queue
        .add_calculation("incremental", "margin", "ratio(amount, cost)", groups.clone(), false)
        .expect("add");
    queue.run_until_idle().expect("run");
    queue.submit_update("incremental", second.clone()).expect("submit");
    queue.run_until_idle().expect("run");

    queue
        .submit_update("full", first.into_iter().chain(second).collect())
        .expect("submit");
    queue.run_until_idle().expect("run");
    queue
        .add_calculation("full", "margin", "ratio(amount, cost)", groups, false)
        .expect("add");
    queue.run_until_idle().expect("run");

    let incremental = stored(&queue, "incremental:region");
    let full = stored(&queue, "full:region");
    for key in ["A", "B", "C"] {
        let left = grouped_value(incremental.frame(), "region", key, "margin");
        let right = grouped_value(full.frame(), "region", key, "margin");
        assert!((left - right).abs() < 1e-12, "{key}: {left} != {right}");
    }
    assert_eq!(grouped_value(full.frame(), "region", "A", "margin"), 2.0);
}

#[test]
fn duplicate_join_key_rejects_the_whole_update() {
    let left = Dataset::with_frame(
        "orders",
        DataFrame::from_rows(&[
            row(&[("code", Scalar::Utf8("a".to_owned())), ("qty", Scalar::Int64(2))]),
            row(&[("code", Scalar::Utf8("b".to_owned())), ("qty", Scalar::Int64(1))]),
        ])
        .expect("frame"),
    );
    let right = Dataset::with_frame(
        "codes",
        DataFrame::from_rows(&[row(&[
            ("code", Scalar::Utf8("a".to_owned())),
            ("name", Scalar::Utf8("alpha".to_owned())),
        ])])
        .expect("frame"),
    );
    let mut queue = queue_with(vec![left, right], UpdatePolicy::immediate());
    join_datasets(queue.calculator().store(), "joined", "orders", "codes", "code")
        .expect("join");
    let codes_before = stored(&queue, "codes").frame().clone();
    let joined_before = stored(&queue, "joined").frame().clone();

    queue
        .submit_update(
            "codes",
            vec![
                row(&[
                    ("code", Scalar::Utf8("c".to_owned())),
                    ("name", Scalar::Utf8("gamma".to_owned())),
                ]),
                row(&[
                    ("code", Scalar::Utf8("a".to_owned())),
                    ("name", Scalar::Utf8("again".to_owned())),
                ]),
            ],
        )
        .expect("submit");
    queue.run_until_idle().expect("run");

    assert_eq!(stored(&queue, "codes").num_rows(), 1);
    assert_eq!(stored(&queue, "codes").frame(), &codes_before);
    assert_eq!(stored(&queue, "joined").frame(), &joined_before);
    assert_eq!(queue.ledger().count(DecisionAction::Rejected), 1);
    let rejection = &queue.ledger().records()[0];
    assert!(rejection.detail.contains("code"), "{}", rejection.detail);

    queue
        .submit_update(
            "codes",
            vec![row(&[
                ("code", Scalar::Utf8("b".to_owned())),
                ("name", Scalar::Utf8("beta".to_owned())),
            ])],
        )
        .expect("submit");
    queue.run_until_idle().expect("run");

    assert_eq!(stored(&queue, "codes").num_rows(), 2);
    let joined = stored(&queue, "joined");
    assert_eq!(joined.num_rows(), 3);
    let names = joined.frame().column("name").expect("name").values();
    assert!(names.contains(&Scalar::Utf8("beta".to_owned())));
}

#[test]
fn left_append_rebuilds_the_joined_dataset() {
    let left = Dataset::with_frame(
        "orders",
        DataFrame::from_rows(&[row(&[
            ("code", Scalar::Utf8("a".to_owned())),
            ("qty", Scalar::Int64(2)),
        ])])
        .expect("frame"),
    );
    let right = Dataset::with_frame(
        "codes",
        DataFrame::from_rows(&[row(&[
            ("code", Scalar::Utf8("a".to_owned())),
            ("name", Scalar::Utf8("alpha".to_owned())),
        ])])
        .expect("frame"),
    );
    let mut queue = queue_with(vec![left, right], UpdatePolicy::immediate());
    join_datasets(queue.calculator().store(), "joined", "orders", "codes", "code")
        .expect("join");

    queue
        .submit_update(
            "orders",
            vec![row(&[
                ("code", Scalar::Utf8("a".to_owned())),
                ("qty", Scalar::Int64(5)),
            ])],
        )
        .expect("submit");
    queue.run_until_idle().expect("run");

    let joined = stored(&queue, "joined");
    assert_eq!(joined.num_rows(), 2);
    assert_eq!(
        joined.frame().column("name").expect("name").values(),
        &[
            Scalar::Utf8("alpha".to_owned()),
            Scalar::Utf8("alpha".to_owned())
        ]
    );
}

fn joined_orders_and_codes() -> UpdateQueue<InMemoryStore> {
    let left = Dataset::with_frame(
        "orders",
        DataFrame::from_rows(&[row(&[
            ("code", Scalar::Utf8("a".to_owned())),
            ("qty", Scalar::Int64(2)),
        ])])
        .expect("frame"),
    );
    let right = Dataset::with_frame(
        "codes",
        DataFrame::from_rows(&[row(&[
            ("code", Scalar::Utf8("a".to_owned())),
            ("name", Scalar::Utf8("alpha".to_owned())),
        ])])
        .expect("frame"),
    );
    let queue = queue_with(vec![left, right], UpdatePolicy::immediate());
    join_datasets(queue.calculator().store(), "joined", "orders", "codes", "code")
        .expect("join");
    queue
}

#[test]
fn left_append_without_a_matching_key_leaves_the_join_alone() {
    let mut queue = joined_orders_and_codes();
    let joined_before = stored(&queue, "joined").frame().clone();

    queue
        .submit_update(
            "orders",
            vec![row(&[
                ("code", Scalar::Utf8("z".to_owned())),
                ("qty", Scalar::Int64(7)),
            ])],
        )
        .expect("submit");
    queue
        .submit_update("orders", vec![row(&[("qty", Scalar::Int64(3))])])
        .expect("submit");
    queue.run_until_idle().expect("run");

    assert_eq!(stored(&queue, "orders").num_rows(), 3);
    assert_eq!(stored(&queue, "joined").frame(), &joined_before);
    assert_eq!(queue.ledger().count(DecisionAction::Applied), 2);
    assert_eq!(queue.ledger().count(DecisionAction::Rejected), 0);
}

#[test]
fn right_append_without_the_key_flows_in_unjoined() {
    let mut queue = joined_orders_and_codes();

    queue
        .submit_update(
            "codes",
            vec![row(&[("name", Scalar::Utf8("delta".to_owned()))])],
        )
        .expect("submit");
    queue.run_until_idle().expect("run");

    let joined = stored(&queue, "joined");
    assert_eq!(joined.num_rows(), 2);
    let rows = joined.frame().to_rows();
    let added = &rows[1];
    assert_eq!(added.get("name"), Some(&Scalar::Utf8("delta".to_owned())));
    assert!(added.get("code").is_none_or(Scalar::is_missing));
    assert!(added.get("qty").is_none_or(Scalar::is_missing));
    assert_eq!(added.get(PARENT_COLUMN), Some(&Scalar::Utf8("codes".to_owned())));
    assert_eq!(queue.ledger().count(DecisionAction::Rejected), 0);
}

#[test]
fn left_rebuild_writes_through_a_held_joined_lease() {
    let mut queue = joined_orders_and_codes();
    let store = queue.calculator().store().clone();
    assert!(
        store
            .try_claim("joined", UpdateId(999), Duration::from_secs(60))
            .expect("claim")
            .is_granted()
    );

    queue
        .submit_update(
            "orders",
            vec![row(&[
                ("code", Scalar::Utf8("a".to_owned())),
                ("qty", Scalar::Int64(5)),
            ])],
        )
        .expect("submit");
    queue.run_until_idle().expect("run");

    assert_eq!(stored(&queue, "joined").num_rows(), 2);
    assert_eq!(
        store
            .try_claim("joined", UpdateId(1000), Duration::from_secs(60))
            .expect("claim"),
        cf_dataset::Claim::Leased(UpdateId(999))
    );
    store.release("joined", UpdateId(999)).expect("release");
}

#[test]
fn held_lease_defers_until_released() {
    let mut queue = queue_with(vec![sales_dataset("sales")], UpdatePolicy::immediate());
    let store = queue.calculator().store().clone();
    assert!(
        store
            .try_claim("sales", UpdateId(999), Duration::from_secs(60))
            .expect("claim")
            .is_granted()
    );

    queue
        .submit_update("sales", vec![sale("A", 1.0)])
        .expect("submit");
    assert_eq!(queue.process_ready().expect("process"), 1);
    assert_eq!(stored(&queue, "sales").num_rows(), 0);
    assert!(!queue.is_idle());

    store.release("sales", UpdateId(999)).expect("release");
    queue.run_until_idle().expect("run");

    assert_eq!(stored(&queue, "sales").num_rows(), 1);
    assert_eq!(queue.ledger().count(DecisionAction::Deferred), 1);
    assert_eq!(queue.ledger().count(DecisionAction::Applied), 1);
    assert!(store.pending_updates("sales").is_empty());
}

#[test]
fn dataset_still_loading_gets_exactly_one_retry() {
    let mut loading = sales_dataset("sales");
    loading.set_ready(false);
    let mut queue = queue_with(vec![loading], UpdatePolicy::immediate());

    queue
        .submit_update("sales", vec![sale("A", 1.0), sale("B", 2.0)])
        .expect("submit");
    queue.process_ready().expect("process");
    assert_eq!(stored(&queue, "sales").num_rows(), 0);

    let mut ready = stored(&queue, "sales");
    ready.set_ready(true);
    queue.calculator().store().put(ready).expect("put");
    queue.run_until_idle().expect("run");

    assert_eq!(stored(&queue, "sales").num_rows(), 2);
    let records = queue.ledger().for_dataset("sales").collect::<Vec<_>>();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].action, DecisionAction::Deferred);
    assert_eq!(records[1].action, DecisionAction::Applied);
    assert_eq!(records[1].attempt, 2);
}

#[test]
fn bounded_retries_give_up() {
    let policy = UpdatePolicy {
        max_retries: Some(2),
        ..UpdatePolicy::immediate()
    };
    let mut queue = queue_with(vec![sales_dataset("sales")], policy);
    let store = queue.calculator().store().clone();
    store
        .try_claim("sales", UpdateId(999), Duration::from_secs(60))
        .expect("claim");

    queue
        .submit_update("sales", vec![sale("A", 1.0)])
        .expect("submit");
    queue.run_until_idle().expect("run");

    assert!(queue.is_idle());
    assert_eq!(queue.ledger().count(DecisionAction::Deferred), 1);
    assert_eq!(queue.ledger().count(DecisionAction::Rejected), 1);
    assert_eq!(stored(&queue, "sales").num_rows(), 0);
}

#[test]
fn updates_to_one_dataset_apply_in_issue_order() {
    let mut queue = queue_with(vec![sales_dataset("sales")], UpdatePolicy::immediate());
    let store = queue.calculator().store().clone();
    queue
        .submit_update("sales", vec![sale("A", 1.0)])
        .expect("submit");
    let second = queue
        .submit_update("sales", vec![sale("B", 2.0)])
        .expect("submit");

    let early = cf_calc::UpdateRequest::new("sales", vec![sale("C", 3.0)], second);
    let outcome = queue.calculator().calculate_updates(&early).expect("update");
    assert!(matches!(outcome, cf_calc::UpdateOutcome::Deferred { .. }));

    queue.run_until_idle().expect("run");
    let regions = stored(&queue, "sales")
        .frame()
        .column("region")
        .expect("region")
        .values()
        .to_vec();
    assert_eq!(
        regions,
        vec![Scalar::Utf8("A".to_owned()), Scalar::Utf8("B".to_owned())]
    );
    assert!(store.pending_updates("sales").is_empty());
}

#[test]
fn merged_children_follow_appends_and_new_columns() {
    let parent = |id: &str, amounts: &[f64]| {
        let rows = amounts
            .iter()
            .map(|amount| row(&[("amount", Scalar::Float64(*amount))]))
            .collect::<Vec<_>>();
        Dataset::with_frame(id, DataFrame::from_rows(&rows).expect("frame"))
    };
    let mut queue = queue_with(
        vec![parent("p1", &[1.0, 2.0]), parent("p2", &[10.0])],
        UpdatePolicy::immediate(),
    );
    merge_datasets(
        queue.calculator().store(),
        "all",
        &[
            ("p1".to_owned(), BTreeMap::new()),
            ("p2".to_owned(), BTreeMap::new()),
        ],
    )
    .expect("merge");
    assert_eq!(stored(&queue, "all").num_rows(), 3);

    queue
        .submit_update("p1", vec![row(&[("amount", Scalar::Float64(3.0))])])
        .expect("submit");
    queue.run_until_idle().expect("run");

    let all = stored(&queue, "all");
    assert_eq!(all.num_rows(), 4);
    let tags = all.frame().column(PARENT_COLUMN).expect("tags").values();
    assert_eq!(
        tags.iter()
            .filter(|tag| **tag == Scalar::Utf8("p1".to_owned()))
            .count(),
        3
    );

    queue
        .add_calculation("p1", "double", "amount * 2", Vec::new(), false)
        .expect("add");
    queue.run_until_idle().expect("run");

    let all = stored(&queue, "all");
    assert_eq!(all.num_rows(), 4);
    let rows = all.frame().to_rows();
    for row in &rows {
        let from_p1 = row.get(PARENT_COLUMN) == Some(&Scalar::Utf8("p1".to_owned()));
        let double = row.get("double").expect("double column");
        if from_p1 {
            let amount = row.get("amount").and_then(|v| v.to_f64().ok()).expect("amount");
            assert_eq!(double.to_f64().expect("double"), amount * 2.0);
        } else {
            assert!(double.is_missing());
        }
    }
}

#[test]
fn aggregated_rows_replace_themselves_in_merged_children() {
    let mut queue = queue_with(vec![sales_dataset("sales")], UpdatePolicy::immediate());
    queue
        .submit_update("sales", vec![sale("A", 5.0), sale("B", 2.0)])
        .expect("submit");
    queue
        .add_calculation("sales", "total", "sum(amount)", vec!["region".to_owned()], false)
        .expect("add");
    queue.run_until_idle().expect("run");

    merge_datasets(
        queue.calculator().store(),
        "rollup",
        &[("sales:region".to_owned(), BTreeMap::new())],
    )
    .expect("merge");
    assert_eq!(stored(&queue, "rollup").num_rows(), 2);

    queue
        .submit_update("sales", vec![sale("A", 1.0)])
        .expect("submit");
    queue.run_until_idle().expect("run");

    let rollup = stored(&queue, "rollup");
    assert_eq!(rollup.num_rows(), 2);
    assert_eq!(grouped_value(rollup.frame(), "region", "A", "total"), 6.0);
}

#[test]
fn replaced_parent_rows_force_a_full_recompute_downstream() {
    let mut queue = queue_with(vec![sales_dataset("sales")], UpdatePolicy::immediate());
    queue
        .submit_update("sales", vec![sale("A", 5.0), sale("B", 2.0)])
        .expect("submit");
    queue
        .add_calculation("sales", "total", "sum(amount)", vec!["region".to_owned()], false)
        .expect("add");
    queue.run_until_idle().expect("run");

    merge_datasets(
        queue.calculator().store(),
        "rollup",
        &[("sales:region".to_owned(), BTreeMap::new())],
    )
    .expect("merge");
    queue
        .add_calculation("rollup", "grand", "sum(total)", Vec::new(), false)
        .expect("add");
    queue
        .add_calculation("rollup", "typical", "mean(total)", Vec::new(), false)
        .expect("add");
    queue.run_until_idle().expect("run");
    assert_eq!(float_at(stored(&queue, "rollup:").frame(), "grand", 0), 7.0);

    queue
        .submit_update("sales", vec![sale("A", 1.0)])
        .expect("submit");
    queue.run_until_idle().expect("run");

    let summary = stored(&queue, "rollup:");
    assert_eq!(summary.num_rows(), 1);
    assert_eq!(float_at(summary.frame(), "grand", 0), 8.0);
    assert_eq!(float_at(summary.frame(), "typical_numerator", 0), 8.0);
    assert_eq!(float_at(summary.frame(), "typical_denominator", 0), 2.0);
    assert_eq!(float_at(summary.frame(), "typical", 0), 4.0);
    assert_eq!(queue.ledger().count(DecisionAction::Rejected), 0);
}

#[test]
fn appends_invalidate_cached_summaries() {
    let mut queue = queue_with(vec![sales_dataset("sales")], UpdatePolicy::immediate());
    queue
        .submit_update("sales", vec![sale("A", 5.0)])
        .expect("submit");
    queue.run_until_idle().expect("run");

    let mut sales = stored(&queue, "sales");
    assert_eq!(sales.summary_stats()["amount"].max, Some(5.0));
    queue.calculator().store().put(sales).expect("put");
    assert!(stored(&queue, "sales").has_cached_summary());

    queue
        .submit_update("sales", vec![sale("A", 9.0)])
        .expect("submit");
    queue.run_until_idle().expect("run");

    let mut sales = stored(&queue, "sales");
    assert!(!sales.has_cached_summary());
    assert_eq!(sales.summary_stats()["amount"].max, Some(9.0));
}

#[test]
fn calculation_names_must_be_free() {
    let mut queue = queue_with(vec![sales_dataset("sales")], UpdatePolicy::immediate());
    queue
        .add_calculation("sales", "double", "amount * 2", Vec::new(), false)
        .expect("add");

    let err = queue
        .add_calculation("sales", "double", "amount * 3", Vec::new(), false)
        .expect_err("collision");
    assert!(matches!(err, CalcError::NameCollision { name, .. } if name == "double"));

    let err = queue
        .add_calculation("sales", "amount", "cost + 1", Vec::new(), false)
        .expect_err("column collision");
    assert!(matches!(err, CalcError::NameCollision { .. }));

    queue
        .add_calculation("sales", "double", "amount * 3", Vec::new(), true)
        .expect("overwrite");
    assert_eq!(
        stored(&queue, "sales")
            .calculation("double")
            .map(|calc| calc.formula.as_str()),
        Some("amount * 3")
    );
}

#[test]
fn invalid_formulas_are_rejected_before_storage() {
    let mut queue = queue_with(vec![sales_dataset("sales")], UpdatePolicy::immediate());
    assert!(matches!(
        queue.add_calculation("sales", "bad", "amount +", Vec::new(), false),
        Err(CalcError::Expr(_))
    ));
    assert!(matches!(
        queue.add_calculation("sales", "bad", "missing * 2", Vec::new(), false),
        Err(CalcError::Expr(_))
    ));
    assert!(stored(&queue, "sales").calculation("bad").is_none());
    assert!(queue.is_idle());
}

#[test]
fn messages_round_trip_through_json() {
    let message = cf_calc::Message::Update(
        cf_calc::UpdateRequest::new("sales", vec![sale("A", 1.0)], UpdateId(4)).from_parent("p"),
    );
    let json = serde_json::to_string(&message).expect("serialize");
    assert!(json.contains("\"kind\":\"update\""));
    let back: cf_calc::Message = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, message);
}
