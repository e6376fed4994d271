use oxidb_pipeline::{
    Accumulator, Datastore, Entity, Group, Matcher, Projection, Schema, Sort,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
struct Event {
    #[serde(rename = "t")]
    kind: String,
    #[serde(rename = "ts")]
    created_at: String,
    user: String,
}

impl Entity for Event {
    fn schema() -> Schema {
        Schema::new("Event", "events")
            .field("kind", "t")
            .field("created_at", "ts")
            .fields(["user"])
    }
}

#[derive(Debug, Deserialize)]
struct ClicksPerUser {
    #[serde(rename = "_id")]
    user: String,
    clicks: u64,
    last_seen: String,
}

fn event(kind: &str, created_at: &str, user: &str) -> Event {
    Event {
        kind: kind.into(),
        created_at: created_at.into(),
        user: user.into(),
    }
}

fn main() -> oxidb_pipeline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let db = Datastore::new();
    db.save_many(&[
        event("click", "2024-01-15T10:30:00Z", "alice"),
        event("view", "2024-03-20T14:00:00Z", "bob"),
        event("click", "2024-06-01T09:00:00Z", "charlie"),
        event("click", "2024-08-10T16:45:00Z", "alice"),
        event("view", "2025-01-05T12:00:00Z", "bob"),
    ])?;

    let mut pipeline = db.create_aggregation::<Event, ClicksPerUser>();
    pipeline
        .project(&[
            Projection::new("kind"),
            Projection::new("created_at"),
            Projection::new("user"),
        ])?
        .matching(&[Matcher::eq("t", "click")])?
        .group(
            "user",
            &[
                Group::grouping("clicks", Accumulator::sum_literal(1)),
                Group::grouping("last_seen", Accumulator::max("ts")),
            ],
        )?
        .sort(&[Sort::descending("clicks"), Sort::ascending("_id")])?;

    println!("=== Pipeline ===");
    println!("{}", Value::Array(pipeline.stages().to_vec()));

    println!("\n=== Clicks per user ===");
    for row in pipeline.aggregate()? {
        let row = row?;
        println!("  {:<8} {} (last {})", row.user, row.clicks, row.last_seen);
    }

    Ok(())
}
