//! End-to-end tests for typed aggregation pipelines.
//!
//! Each test saves typed records into an in-memory `Datastore`, builds a
//! pipeline through the public builder API, and checks both the compiled
//! stage documents and the typed results that come back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use oxidb_pipeline::{
    Accumulator, AggregationOptions, Datastore, Entity, Error, Group, GroupId, Matcher,
    Projection, Schema, Sort, parse_aggregation_options,
};

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// Stored with abbreviated field names, like a record mapped onto a legacy
/// collection.
#[derive(Debug, Clone, Serialize)]
struct Sale {
    #[serde(rename = "_id")]
    id: u64,
    #[serde(rename = "reg")]
    region: String,
    #[serde(rename = "amt")]
    amount: i64,
    year: i32,
    #[serde(rename = "cust")]
    customer: Customer,
    tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Customer {
    #[serde(rename = "nm")]
    name: String,
    city: String,
}

impl Entity for Sale {
    fn schema() -> Schema {
        Schema::new("Sale", "sales")
            .field("id", "_id")
            .field("region", "reg")
            .field("amount", "amt")
            .field("customer", "cust")
            .field("name", "nm")
            .fields(["year", "city", "tags"])
    }
}

#[derive(Debug, Deserialize, PartialEq)]
struct RegionTotal {
    #[serde(rename = "_id")]
    region: String,
    total: i64,
    orders: i64,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Key {
    reg: String,
    year: i32,
}

#[derive(Debug, Deserialize, PartialEq)]
struct YearlyTotal {
    #[serde(rename = "_id")]
    key: Key,
    total: i64,
}

#[derive(Debug, Deserialize)]
struct TaggedSale {
    #[serde(rename = "_id")]
    id: u64,
    tags: String,
}

#[derive(Debug, Deserialize, PartialEq)]
struct CustomerView {
    #[serde(rename = "_id")]
    id: u64,
    cust: CustomerName,
}

#[derive(Debug, Deserialize, PartialEq)]
struct CustomerName {
    nm: String,
}

fn sale(id: u64, region: &str, amount: i64, year: i32, name: &str, tags: &[&str]) -> Sale {
    Sale {
        id,
        region: region.to_string(),
        amount,
        year,
        customer: Customer {
            name: name.to_string(),
            city: "Lyon".to_string(),
        },
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

fn seeded() -> Datastore {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let db = Datastore::new();
    db.save_many(&[
        sale(1, "north", 100, 2023, "Ana", &["new"]),
        sale(2, "south", 40, 2023, "Ben", &[]),
        sale(3, "north", 60, 2024, "Cy", &["vip", "new"]),
        sale(4, "east", 10, 2024, "Di", &["vip"]),
        sale(5, "south", 90, 2024, "Ed", &["vip"]),
    ])
    .unwrap();
    db
}

fn collect<U>(results: impl Iterator<Item = oxidb_pipeline::Result<Arc<U>>>) -> Vec<Arc<U>> {
    results.collect::<oxidb_pipeline::Result<Vec<_>>>().unwrap()
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

#[test]
fn project_group_match_sort() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, RegionTotal>();
    pipeline
        .project(&[Projection::new("region"), Projection::new("amount")])
        .unwrap()
        .group(
            "reg",
            &[
                Group::grouping("total", Accumulator::sum("amt")),
                Group::grouping("orders", Accumulator::sum_literal(1)),
            ],
        )
        .unwrap()
        .matching(&[Matcher::new("total", "$gt", 50)])
        .unwrap()
        .sort(&[Sort::descending("total")])
        .unwrap();

    assert_eq!(
        pipeline.stages(),
        [
            json!({"$project": {"reg": 1, "amt": 1}}),
            json!({"$group": {
                "_id": "$reg",
                "total": {"$sum": "$amt"},
                "orders": {"$sum": 1}
            }}),
            json!({"$match": {"total": {"$gt": 50}}}),
            json!({"$sort": {"total": -1}}),
        ]
    );

    let totals = collect(pipeline.aggregate().unwrap());
    let totals: Vec<&RegionTotal> = totals.iter().map(Arc::as_ref).collect();
    assert_eq!(
        totals,
        [
            &RegionTotal {
                region: "north".into(),
                total: 160,
                orders: 2
            },
            &RegionTotal {
                region: "south".into(),
                total: 130,
                orders: 2
            },
        ]
    );
}

#[test]
fn composite_group_key() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, YearlyTotal>();
    pipeline
        .group(
            vec![Group::key("reg"), Group::key("year")],
            &[Group::grouping("total", Accumulator::sum("amt"))],
        )
        .unwrap()
        .sort(&[Sort::ascending("_id.reg"), Sort::descending("_id.year")])
        .unwrap();

    assert_eq!(
        pipeline.stages()[0],
        json!({"$group": {
            "_id": {"reg": "$reg", "year": "$year"},
            "total": {"$sum": "$amt"}
        }})
    );

    let rows = collect(pipeline.aggregate().unwrap());
    let summary: Vec<(&str, i32, i64)> = rows
        .iter()
        .map(|r| (r.key.reg.as_str(), r.key.year, r.total))
        .collect();
    assert_eq!(
        summary,
        [
            ("east", 2024, 10),
            ("north", 2024, 60),
            ("north", 2023, 100),
            ("south", 2024, 90),
            ("south", 2023, 40),
        ]
    );
}

#[test]
fn nested_first_stage_projection_round_trips() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, CustomerView>();
    pipeline
        .project(&[Projection::nested("customer", vec![Projection::new("name")])])
        .unwrap()
        .sort(&[Sort::ascending("_id")])
        .unwrap()
        .limit(2)
        .unwrap();

    assert_eq!(pipeline.stages()[0], json!({"$project": {"cust": {"nm": 1}}}));

    let views = collect(pipeline.aggregate().unwrap());
    assert_eq!(views.len(), 2);
    assert_eq!(
        *views[0],
        CustomerView {
            id: 1,
            cust: CustomerName { nm: "Ana".into() }
        }
    );
}

#[test]
fn later_projection_uses_previous_stage_names() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, Value>();
    pipeline
        .group(GroupId::Null, &[Group::grouping("revenue", Accumulator::sum("amt"))])
        .unwrap()
        .project(&[
            Projection::new("_id").suppress(),
            Projection::renamed("gross", "revenue"),
        ])
        .unwrap();

    assert_eq!(
        pipeline.stages()[1],
        json!({"$project": {"_id": 0, "gross": "$revenue"}})
    );
    let rows = collect(pipeline.aggregate().unwrap());
    assert_eq!(*rows[0], json!({"gross": 300}));
}

#[test]
fn unwind_and_count_tags() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, Value>();
    pipeline
        .unwind("tags")
        .unwrap()
        .group("tags", &[Group::grouping("n", Accumulator::count())])
        .unwrap()
        .sort(&[Sort::descending("n"), Sort::ascending("_id")])
        .unwrap();

    let rows = collect(pipeline.aggregate().unwrap());
    let rows: Vec<&Value> = rows.iter().map(Arc::as_ref).collect();
    assert_eq!(
        rows,
        [&json!({"_id": "vip", "n": 3}), &json!({"_id": "new", "n": 2})]
    );
}

#[test]
fn unwound_rows_sharing_an_id_keep_their_own_values() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, TaggedSale>();
    pipeline
        .matching(&[Matcher::eq("_id", 3)])
        .unwrap()
        .unwind("tags")
        .unwrap();

    let rows = collect(pipeline.aggregate().unwrap());
    let tags: Vec<(u64, &str)> = rows.iter().map(|r| (r.id, r.tags.as_str())).collect();
    assert_eq!(tags, [(3, "vip"), (3, "new")]);
}

#[test]
fn match_operators_run_against_stored_names() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, Value>();
    pipeline
        .matching(&[
            Matcher::in_("reg", ["north", "east"]),
            Matcher::regex("cust.nm", "^[AD]"),
        ])
        .unwrap()
        .skip(1)
        .unwrap();

    let rows = collect(pipeline.aggregate().unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], 4);
}

// ---------------------------------------------------------------------------
// Errors and lifecycle
// ---------------------------------------------------------------------------

#[test]
fn unmapped_first_stage_field_is_rejected() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, Value>();
    let err = pipeline
        .project(&[Projection::new("region"), Projection::new("reg")])
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "no mapped field 'reg' on entity Sale");
    assert!(pipeline.stages().is_empty());
}

#[test]
fn execution_errors_propagate_from_aggregate() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, Value>();
    pipeline
        .matching(&[Matcher::new("amt", "$near", 3)])
        .unwrap();
    assert!(matches!(pipeline.aggregate(), Err(Error::InvalidQuery(_))));
}

#[test]
fn request_options_enforce_max_time() {
    let db = seeded();
    let options = parse_aggregation_options(&json!({
        "batchSize": 2,
        "maxTimeMS": 0,
        "allowDiskUse": true
    }))
    .unwrap();
    assert_eq!(options.batch_size, 2);

    let mut pipeline = db.create_aggregation::<Sale, Value>();
    pipeline.sort(&[Sort::ascending("amt")]).unwrap();
    assert!(matches!(
        pipeline.aggregate_with(options),
        Err(Error::Timeout(0))
    ));
}

#[test]
fn results_are_streamed_in_batches() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, Value>();
    let mut results = pipeline
        .aggregate_with(AggregationOptions::default().with_batch_size(2))
        .unwrap();

    assert_eq!(results.collection(), "sales");
    assert!(results.cache().is_empty());
    results.next().unwrap().unwrap();
    assert_eq!(results.cache().len(), 1);
    assert_eq!(results.by_ref().count(), 4);
    assert_eq!(results.cache().len(), 5);
}

#[test]
fn each_aggregate_gets_a_fresh_cache() {
    let db = seeded();
    let mut first = db.create_aggregation::<Sale, Value>();
    let mut second = db.create_aggregation::<Sale, Value>();
    let a = collect(first.aggregate().unwrap());
    let b = collect(second.aggregate().unwrap());
    assert_eq!(a.len(), 5);
    assert!(!Arc::ptr_eq(&a[0], &b[0]));
}

#[test]
fn pipeline_cannot_be_reused() {
    let db = seeded();
    let mut pipeline = db.create_aggregation::<Sale, Value>();
    pipeline.limit(1).unwrap();
    assert_eq!(collect(pipeline.aggregate().unwrap()).len(), 1);
    assert!(matches!(pipeline.limit(1), Err(Error::PipelineConsumed)));
    assert!(matches!(pipeline.aggregate(), Err(Error::PipelineConsumed)));
}
