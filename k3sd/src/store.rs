/*
 * Append-only history of cluster descriptors, one SQLite row per run and
 * per cluster, keyed by the master (address, node name).
 */
use crate::errors::{Error, Result};
use k3sd_api::Cluster;

use log;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/* how long a writer waits for another process holding the database */
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cluster_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL,
    node_name TEXT NOT NULL,
    version INTEGER NOT NULL,
    cluster TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(address, node_name, version)
);

CREATE INDEX IF NOT EXISTS idx_cluster_versions_key ON cluster_versions(address, node_name);
"#;

pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {

    /*
     * Opens (or creates) the database file, creating its directory first.
     */
    pub fn open(path: &Path) -> Result<Self> {
	if let Some(parent) = path.parent() {
	    if !parent.as_os_str().is_empty() && !parent.exists() {
		log::info!("Creating state directory {}", parent.display());
		std::fs::create_dir_all(parent)?;
	    }
	}

	log::debug!("Opening state store {}", path.display());
	let conn = Connection::open(path)?;
	conn.busy_timeout(BUSY_TIMEOUT)?;
	Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
	Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
	conn.execute_batch(SCHEMA)?;

	Ok(Self{
	    conn: Mutex::new(conn),
	})
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
	self.conn.lock()
	    .map_err(|_| Error::Persistence(String::from("state store lock is poisoned")))
    }

    /*
     * Appends `cluster` as the next version of its key and returns the
     * version it follows (0 when there was none). Reading the current
     * maximum and inserting happen in one immediate transaction.
     */
    pub fn insert(&self, cluster: &Cluster) -> Result<u32> {
	let payload = serde_json::to_string(cluster)?;
	let mut conn = self.lock()?;

	let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
	let previous: u32 = tx.query_row(
	    "SELECT COALESCE(MAX(version), 0) FROM cluster_versions WHERE address = ?1 AND node_name = ?2",
	    params![cluster.address(), cluster.node_name()],
	    |row| row.get(0),
	)?;
	tx.execute(
	    "INSERT INTO cluster_versions (address, node_name, version, cluster) VALUES (?1, ?2, ?3, ?4)",
	    params![cluster.address(), cluster.node_name(), previous + 1, payload],
	)?;
	tx.commit()?;

	log::debug!("Stored version {} of {}/{}", previous + 1, cluster.address(), cluster.node_name());
	Ok(previous)
    }

    /*
     * Returns the descriptor stored as `version` for the key of `cluster`.
     */
    pub fn get_version(&self, cluster: &Cluster, version: u32) -> Result<Option<Cluster>> {
	if version < 1 {
	    return Ok(None);
	}

	let conn = self.lock()?;
	let payload: Option<String> = conn.query_row(
	    "SELECT cluster FROM cluster_versions WHERE address = ?1 AND node_name = ?2 AND version = ?3",
	    params![cluster.address(), cluster.node_name(), version],
	    |row| row.get(0),
	).optional()?;

	match payload {
	    Some(payload) => Ok(Some(decode(&payload)?)),
	    None => Ok(None),
	}
    }

    pub fn latest(&self, cluster: &Cluster) -> Result<Option<(u32, Cluster)>> {
	let conn = self.lock()?;
	let row: Option<(u32, String)> = conn.query_row(
	    "SELECT version, cluster FROM cluster_versions WHERE address = ?1 AND node_name = ?2 \
	     ORDER BY version DESC LIMIT 1",
	    params![cluster.address(), cluster.node_name()],
	    |row| Ok((row.get(0)?, row.get(1)?)),
	).optional()?;

	match row {
	    Some((version, payload)) => Ok(Some((version, decode(&payload)?))),
	    None => Ok(None),
	}
    }

    /*
     * Forgets every version of the key of `cluster`.
     */
    pub fn delete(&self, cluster: &Cluster) -> Result<usize> {
	let conn = self.lock()?;
	let removed = conn.execute(
	    "DELETE FROM cluster_versions WHERE address = ?1 AND node_name = ?2",
	    params![cluster.address(), cluster.node_name()],
	)?;

	log::debug!("Removed {} stored versions of {}/{}", removed, cluster.address(), cluster.node_name());
	Ok(removed)
    }
}

fn decode(payload: &str) -> Result<Cluster> {
    serde_json::from_str(payload)
	.map_err(|err| Error::Persistence(format!("stored descriptor is not valid: {}", err)))
}
