//! Quickstart Example
//!
//! Create a database, store and read back a document, attach a file, then
//! clean up.
//!
//! Run with: cargo run --example quickstart
//! The server URL comes from `COUCHDB_URI` (default http://localhost:5984/).

use serde_json::json;
use settee_rs::telemetry::init_telemetry;
use settee_rs::{Database, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_telemetry(None)?;
    println!("Settee Quickstart\n");

    let server = Server::from_env()?;
    println!("Connected to {} (version {})", server, server.version().await?);

    let name = "settee-quickstart";
    if server.contains(name).await? {
        server.delete(name).await?;
    }
    let db: Database = server.create(name).await?;
    println!("Created {}\n", db);

    // Store a document with a generated id
    let mut doc = json!({"type": "Person", "name": "John Doe"});
    let (id, rev) = db.save(&mut doc).await?;
    println!("Saved {} at revision {}", id, rev);

    // Update it in place; the new _rev is written back into `doc`
    doc["name"] = json!("Mary Jane");
    let rev = db.set(&id, &mut doc).await?;
    println!("Updated to revision {}", rev);

    if let Some(stored) = db.get(&id).await? {
        println!("Read back: {}\n", stored);
    }

    db.put_attachment(&mut doc, "Hello from settee", Some("hello.txt"), None)
        .await?;
    if let Some(attachment) = db.get_attachment(&id, "hello.txt").await? {
        let content_type = attachment.content_type().unwrap_or("unknown").to_string();
        println!("Attachment ({}): {}", content_type, attachment.text().await?);
    }

    server.delete(name).await?;
    println!("\nDeleted {}", name);
    Ok(())
}
