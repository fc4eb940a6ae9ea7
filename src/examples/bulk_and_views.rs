//! Bulk Updates and Views Example
//!
//! Loads documents in one bulk request, stores a design document and queries
//! its views, including a reduce and a multi-key lookup.
//!
//! Run with: cargo run --example bulk_and_views

use serde_json::{json, Value};
use settee_rs::telemetry::init_telemetry;
use settee_rs::{Row, Server, ViewOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_telemetry(None)?;

    let server = Server::from_env()?;
    let name = "settee-views";
    if server.contains(name).await? {
        server.delete(name).await?;
    }
    let db = server.create(name).await?;

    let mut docs: Vec<Value> = [("Gotham", 1_500_000), ("Metropolis", 11_000_000), ("Smallville", 45_000)]
        .iter()
        .map(|(city, population)| json!({"type": "City", "name": city, "population": population}))
        .collect();
    for result in db.update(&mut docs, false).await? {
        match result.rev() {
            Some(rev) => println!("stored {} at {}", result.id, rev),
            None => println!("failed {}: {:?}", result.id, result.error()),
        }
    }

    let mut design = json!({
        "views": {
            "by_name": {
                "map": "function(doc) { if (doc.type == 'City') emit(doc.name, doc.population); }",
                "reduce": "_sum"
            }
        }
    });
    db.set("_design/cities", &mut design).await?;

    println!("\nAll cities:");
    let all = db.view("cities/by_name", ViewOptions::new().reduce(false))?;
    for row in all.rows().await? {
        println!("  {}", row);
    }

    let total = db.view("cities/by_name", ViewOptions::new())?;
    if let Some(row) = total.rows().await?.first() {
        println!("\nTotal population: {}", row.value);
    }

    // Rows come back in the order the keys were requested
    let picked = db.view_with(
        "cities/by_name",
        ViewOptions::new().reduce(false).keys(["Smallville", "Gotham"]),
        |row: Row| row.key.as_str().unwrap_or_default().to_string(),
    )?;
    println!("\nPicked: {:?}", picked.rows().await?);

    server.delete(name).await?;
    Ok(())
}
