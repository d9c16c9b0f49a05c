//! Crawled STATS responses.

use rusqlite::{Connection, OptionalExtension};
use tribler_wire::stats::{CircuitStats, RelayStats, StatsReport};

use crate::{DbError, Result};

/// A stored response.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultRow {
    pub id: i64,
    pub peer: String,
    pub received_at: u64,
    pub report: StatsReport,
}

/// Store one response with its circuit and relay entries. Returns the
/// new `result.id`.
pub fn insert(conn: &Connection, peer: &str, received_at: u64, report: &StatsReport) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO result
         (peer, received_at, uptime_secs, bytes_up, bytes_down,
          bytes_relay_up, bytes_relay_down, bytes_exit, dropped_exit)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            peer,
            received_at as i64,
            report.uptime_secs as i64,
            report.bytes_up as i64,
            report.bytes_down as i64,
            report.bytes_relay_up as i64,
            report.bytes_relay_down as i64,
            report.bytes_exit as i64,
            report.dropped_exit as i64,
        ],
    )?;
    let id = tx.last_insert_rowid();

    {
        let mut circuit = tx.prepare(
            "INSERT OR REPLACE INTO result_circuit
             (result_id, circuit_id, hops, bytes_up, bytes_down, speed_up, speed_down, age_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for c in &report.circuits {
            circuit.execute(rusqlite::params![
                id,
                c.circuit_id as i64,
                c.hops as i64,
                c.bytes_up as i64,
                c.bytes_down as i64,
                c.speed_up,
                c.speed_down,
                c.age_secs as i64,
            ])?;
        }

        let mut relay = tx.prepare(
            "INSERT OR REPLACE INTO result_relay (result_id, circuit_id, bytes, speed)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for r in &report.relays {
            relay.execute(rusqlite::params![id, r.circuit_id as i64, r.bytes as i64, r.speed])?;
        }
    }
    tx.commit()?;
    tracing::debug!(
        peer,
        id,
        circuits = report.circuits.len(),
        relays = report.relays.len(),
        "stats stored"
    );
    Ok(id)
}

/// Load a response by id.
pub fn get(conn: &Connection, id: i64) -> Result<ResultRow> {
    let head = conn
        .query_row(
            "SELECT id, peer, received_at, uptime_secs, bytes_up, bytes_down,
                    bytes_relay_up, bytes_relay_down, bytes_exit, dropped_exit
             FROM result WHERE id = ?1",
            [id],
            |row| {
                Ok(ResultRow {
                    id: row.get(0)?,
                    peer: row.get(1)?,
                    received_at: row.get::<_, i64>(2)? as u64,
                    report: StatsReport {
                        uptime_secs: row.get::<_, i64>(3)? as u64,
                        bytes_up: row.get::<_, i64>(4)? as u64,
                        bytes_down: row.get::<_, i64>(5)? as u64,
                        bytes_relay_up: row.get::<_, i64>(6)? as u64,
                        bytes_relay_down: row.get::<_, i64>(7)? as u64,
                        bytes_exit: row.get::<_, i64>(8)? as u64,
                        dropped_exit: row.get::<_, i64>(9)? as u64,
                        circuits: Vec::new(),
                        relays: Vec::new(),
                    },
                })
            },
        )
        .optional()?;
    let mut row = head.ok_or_else(|| DbError::NotFound(format!("result {id}")))?;
    row.report.circuits = circuits(conn, id)?;
    row.report.relays = relays(conn, id)?;
    Ok(row)
}

fn circuits(conn: &Connection, result_id: i64) -> Result<Vec<CircuitStats>> {
    let mut stmt = conn.prepare(
        "SELECT circuit_id, hops, bytes_up, bytes_down, speed_up, speed_down, age_secs
         FROM result_circuit WHERE result_id = ?1 ORDER BY circuit_id",
    )?;
    let rows = stmt
        .query_map([result_id], |row| {
            Ok(CircuitStats {
                circuit_id: row.get::<_, i64>(0)? as u32,
                hops: row.get::<_, i64>(1)? as u8,
                bytes_up: row.get::<_, i64>(2)? as u64,
                bytes_down: row.get::<_, i64>(3)? as u64,
                speed_up: row.get(4)?,
                speed_down: row.get(5)?,
                age_secs: row.get::<_, i64>(6)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn relays(conn: &Connection, result_id: i64) -> Result<Vec<RelayStats>> {
    let mut stmt = conn.prepare(
        "SELECT circuit_id, bytes, speed FROM result_relay
         WHERE result_id = ?1 ORDER BY circuit_id",
    )?;
    let rows = stmt
        .query_map([result_id], |row| {
            Ok(RelayStats {
                circuit_id: row.get::<_, i64>(0)? as u32,
                bytes: row.get::<_, i64>(1)? as u64,
                speed: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Most recent response from `peer`.
pub fn latest_for_peer(conn: &Connection, peer: &str) -> Result<ResultRow> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM result WHERE peer = ?1 ORDER BY received_at DESC, id DESC LIMIT 1",
            [peer],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => get(conn, id),
        None => Err(DbError::NotFound(format!("results for '{peer}'"))),
    }
}

/// Distinct peers with at least one stored response.
pub fn peers(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT peer FROM result ORDER BY peer")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(rows)
}

pub fn count(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM result", [], |row| row.get(0))?;
    Ok(n as u64)
}

/// Delete responses received before `cutoff`. Child rows cascade.
pub fn prune_before(conn: &Connection, cutoff: u64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM result WHERE received_at < ?1",
        [cutoff as i64],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    fn report() -> StatsReport {
        StatsReport {
            uptime_secs: 120,
            bytes_up: 4096,
            bytes_down: 8192,
            bytes_relay_up: 10,
            bytes_relay_down: 20,
            bytes_exit: 30,
            dropped_exit: 1,
            circuits: vec![CircuitStats {
                circuit_id: 77,
                hops: 3,
                bytes_up: 100,
                bytes_down: 200,
                speed_up: 1.5,
                speed_down: 2.5,
                age_secs: 60,
            }],
            relays: vec![
                RelayStats {
                    circuit_id: 5,
                    bytes: 500,
                    speed: 0.0,
                },
                RelayStats {
                    circuit_id: 9,
                    bytes: 900,
                    speed: 12.0,
                },
            ],
        }
    }

    #[test]
    fn test_insert_and_get() {
        let conn = test_db();
        let id = insert(&conn, "10.0.0.1:7000", 1_700_000_000, &report()).expect("insert");
        let row = get(&conn, id).expect("get");
        assert_eq!(row.peer, "10.0.0.1:7000");
        assert_eq!(row.received_at, 1_700_000_000);
        assert_eq!(row.report, report());
    }

    #[test]
    fn test_get_missing() {
        let conn = test_db();
        assert!(matches!(get(&conn, 42), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_latest_and_peers() {
        let conn = test_db();
        let mut later = report();
        later.uptime_secs = 999;
        insert(&conn, "a:1", 10, &report()).expect("first");
        insert(&conn, "a:1", 20, &later).expect("second");
        insert(&conn, "b:2", 15, &StatsReport::default()).expect("other");

        let latest = latest_for_peer(&conn, "a:1").expect("latest");
        assert_eq!(latest.report.uptime_secs, 999);
        assert_eq!(peers(&conn).expect("peers"), vec!["a:1", "b:2"]);
        assert!(matches!(
            latest_for_peer(&conn, "c:3"),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_prune_cascades() {
        let conn = test_db();
        insert(&conn, "a:1", 10, &report()).expect("old");
        insert(&conn, "a:1", 50, &report()).expect("new");
        assert_eq!(prune_before(&conn, 30).expect("prune"), 1);
        assert_eq!(count(&conn).expect("count"), 1);

        let relays: i64 = conn
            .query_row("SELECT COUNT(*) FROM result_relay", [], |row| row.get(0))
            .expect("relays");
        assert_eq!(relays, 2);
    }
}
