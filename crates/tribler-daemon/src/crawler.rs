//! Persists crawled STATS responses.

use std::sync::Arc;

use anyhow::anyhow;
use rusqlite::Connection;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use tribler_db::queries::results;
use tribler_wire::StatsReport;

use crate::events::{Event, EventFilter};

/// Write every `TunnelStats` event into the database until the bus closes.
pub async fn run(mut events: broadcast::Receiver<Event>, db: Arc<Mutex<Connection>>) {
    let filter = EventFilter::only("stats");
    loop {
        match events.recv().await {
            Ok(event) if filter.matches(&event) => {
                let conn = db.lock().await;
                match store(&conn, &event) {
                    Ok(id) => debug!(id, "crawl result stored"),
                    Err(e) => warn!(error = %e, "crawl result dropped"),
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "crawler fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

pub fn store(conn: &Connection, event: &Event) -> anyhow::Result<i64> {
    let peer = event.payload["peer"]
        .as_str()
        .ok_or_else(|| anyhow!("stats event without peer"))?;
    let report: StatsReport = serde_json::from_value(event.payload["report"].clone())?;
    Ok(results::insert(conn, peer, event.timestamp, &report)?)
}
