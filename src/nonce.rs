//! Per-address nonces
//!
//! Callers sign requests with a nonce greater than the last one seen for
//! their address. The `nonce` command reads the current value; an address
//! seen for the first time starts at zero.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{NodeError, NodeResult};

pub struct NonceStore {
    conn: Mutex<Connection>,
}

impl NonceStore {
    /// Open or create `nonces.db` under `data_dir`.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("nonces.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "Nonce store initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nonces (
                address TEXT PRIMARY KEY,
                nonce INTEGER NOT NULL
            );",
        )
        .context("creating nonces table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> NodeResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NodeError::Storage(format!("Lock poisoned: {}", e)))
    }

    /// Current nonce for `address`, recording zero for unseen addresses.
    /// Addresses compare case-insensitively.
    pub fn nonce(&self, address: &str) -> NodeResult<u64> {
        let address = normalize(address)?;
        let conn = self.lock()?;
        let existing: Option<i64> = conn
            .query_row("SELECT nonce FROM nonces WHERE address = ?1", [&address], |row| row.get(0))
            .optional()?;
        match existing {
            Some(nonce) => Ok(nonce.max(0) as u64),
            None => {
                conn.execute("INSERT INTO nonces (address, nonce) VALUES (?1, 0)", [&address])?;
                debug!(%address, "First nonce request");
                Ok(0)
            }
        }
    }

    /// Record `nonce` for `address` if it is newer than the stored one.
    /// Returns false for a stale or replayed nonce.
    pub fn advance(&self, address: &str, nonce: u64) -> NodeResult<bool> {
        let address = normalize(address)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT INTO nonces (address, nonce) VALUES (?1, ?2)
             ON CONFLICT(address) DO UPDATE SET nonce = excluded.nonce
             WHERE excluded.nonce > nonces.nonce",
            params![address, nonce as i64],
        )?;
        Ok(changed > 0)
    }
}

fn normalize(address: &str) -> NodeResult<String> {
    let address = address.trim();
    if address.is_empty() {
        return Err(NodeError::BadRequest("Missing address".to_string()));
    }
    Ok(address.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ADDRESS: &str = "0xBE5449a6A97aD46c8558A3356267Ee5D2731ab5e";

    #[test]
    fn test_unseen_address_starts_at_zero() {
        let store = NonceStore::open_in_memory().unwrap();
        assert_eq!(store.nonce(ADDRESS).unwrap(), 0);
        assert_eq!(store.nonce(&ADDRESS.to_lowercase()).unwrap(), 0);
    }

    #[test]
    fn test_only_newer_nonces_advance() {
        let store = NonceStore::open_in_memory().unwrap();
        assert!(store.advance(ADDRESS, 5).unwrap());
        assert!(!store.advance(ADDRESS, 5).unwrap());
        assert!(!store.advance(&ADDRESS.to_uppercase(), 3).unwrap());
        assert_eq!(store.nonce(ADDRESS).unwrap(), 5);
    }

    #[test]
    fn test_blank_address_rejected() {
        let store = NonceStore::open_in_memory().unwrap();
        assert!(matches!(store.nonce("  "), Err(NodeError::BadRequest(_))));
    }

    #[test]
    fn test_nonces_survive_reopen() {
        let dir = TempDir::new().unwrap();
        NonceStore::open(dir.path()).unwrap().advance(ADDRESS, 7).unwrap();
        assert_eq!(NonceStore::open(dir.path()).unwrap().nonce(ADDRESS).unwrap(), 7);
    }
}
