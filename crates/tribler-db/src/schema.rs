//! SQL schema definitions.

/// Schema v1.
pub const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS result (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    peer TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    uptime_secs INTEGER NOT NULL,
    bytes_up INTEGER NOT NULL,
    bytes_down INTEGER NOT NULL,
    bytes_relay_up INTEGER NOT NULL,
    bytes_relay_down INTEGER NOT NULL,
    bytes_exit INTEGER NOT NULL,
    dropped_exit INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_result_peer ON result(peer, received_at);

CREATE TABLE IF NOT EXISTS result_circuit (
    result_id INTEGER NOT NULL REFERENCES result(id) ON DELETE CASCADE,
    circuit_id INTEGER NOT NULL,
    hops INTEGER NOT NULL,
    bytes_up INTEGER NOT NULL,
    bytes_down INTEGER NOT NULL,
    speed_up REAL NOT NULL,
    speed_down REAL NOT NULL,
    age_secs INTEGER NOT NULL,
    PRIMARY KEY (result_id, circuit_id)
);

CREATE TABLE IF NOT EXISTS result_relay (
    result_id INTEGER NOT NULL REFERENCES result(id) ON DELETE CASCADE,
    circuit_id INTEGER NOT NULL,
    bytes INTEGER NOT NULL,
    speed REAL NOT NULL,
    PRIMARY KEY (result_id, circuit_id)
);
"#;
