//! Follow Changes Example
//!
//! Writes a few documents and follows the continuous change feed until the
//! server ends it with `last_seq`.
//!
//! Run with: cargo run --example follow_changes

use serde_json::json;
use settee_rs::telemetry::init_telemetry;
use settee_rs::{ChangeEvent, ChangesOptions, Server};
use std::path::Path;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_telemetry(Some(Path::new("./logs")))?;

    let server = Server::from_env()?;
    let name = "settee-changes";
    if server.contains(name).await? {
        server.delete(name).await?;
    }
    let db = server.create(name).await?;

    for i in 0..5 {
        let mut doc = json!({"n": i});
        db.set(&format!("doc-{}", i), &mut doc).await?;
    }
    db.delete("doc-0").await?;

    // A zero timeout makes the server close the feed once it has caught up
    let options = ChangesOptions::continuous().heartbeat(1000).timeout(0);
    let mut feed = db.changes(&options).await?;
    while let Some(event) = feed.next().await {
        match event? {
            ChangeEvent::Change(change) => println!(
                "seq {}: {}{}",
                change.seq,
                change.id,
                if change.deleted { " (deleted)" } else { "" }
            ),
            ChangeEvent::LastSeq(seq) => println!("caught up at {}", seq),
        }
    }

    server.delete(name).await?;
    Ok(())
}
