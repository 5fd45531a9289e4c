//! Local DDO storage
//!
//! A key-value document store: whole DDO bodies keyed by id, with the chain id
//! and NFT address pulled out into columns for chain-wide deletes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::Ddo;
use crate::error::{NodeError, NodeResult};

/// Document store collaborator.
///
/// `retrieve` returns `None` for unknown ids rather than an error.
pub trait DocumentStore: Send + Sync {
    fn create(&self, ddo: &Value) -> NodeResult<()>;

    fn retrieve(&self, id: &str) -> NodeResult<Option<Value>>;

    fn update(&self, ddo: &Value) -> NodeResult<()>;

    /// Returns true when a document was removed.
    fn delete(&self, id: &str) -> NodeResult<bool>;

    /// Equality filters on dotted JSON paths (`metadata.type`), 1-based pages.
    fn search(&self, query: &Map<String, Value>, page: usize, per_page: usize) -> NodeResult<Vec<Value>>;

    fn delete_all_from_chain(&self, chain_id: u64) -> NodeResult<usize>;

    /// Every stored id, oldest first.
    fn ids(&self) -> NodeResult<Vec<String>>;
}

pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    /// Open or create `ddos.db` under `data_dir`.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("ddos.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "DDO store initialized");
        Ok(store)
    }

    /// In-memory store for tests and indexer-less nodes.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ddos (
                id TEXT PRIMARY KEY,
                chain_id INTEGER,
                nft_address TEXT,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_ddos_chain ON ddos(chain_id);",
        )
        .context("creating ddos table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> NodeResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NodeError::Storage(format!("Lock poisoned: {}", e)))
    }
}

fn columns(ddo: &Value) -> NodeResult<(String, Option<i64>, Option<String>, String)> {
    let view = Ddo(ddo.clone());
    let id = view
        .id()
        .ok_or_else(|| NodeError::BadRequest("DDO has no id".to_string()))?
        .to_string();
    let chain_id = view.chain_id().map(|c| c as i64);
    let nft = view.nft_address().map(str::to_string);
    Ok((id, chain_id, nft, serde_json::to_string(ddo)?))
}

/// `metadata.type` -> `$.metadata.type`; only plain identifiers are accepted.
fn json_path(key: &str) -> NodeResult<String> {
    let valid = !key.is_empty()
        && key
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if !valid {
        return Err(NodeError::BadRequest(format!("Invalid search field: {}", key)));
    }
    Ok(format!("$.{}", key))
}

impl DocumentStore for SqliteDocumentStore {
    fn create(&self, ddo: &Value) -> NodeResult<()> {
        let (id, chain_id, nft, body) = columns(ddo)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ddos (id, chain_id, nft_address, body) VALUES (?1, ?2, ?3, ?4)",
            params![id, chain_id, nft, body],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                NodeError::BadRequest(format!("DDO {} already exists", id))
            }
            other => other.into(),
        })?;
        debug!(%id, "Stored DDO");
        Ok(())
    }

    fn retrieve(&self, id: &str) -> NodeResult<Option<Value>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM ddos WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn update(&self, ddo: &Value) -> NodeResult<()> {
        let (id, chain_id, nft, body) = columns(ddo)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE ddos SET chain_id = ?2, nft_address = ?3, body = ?4,
                updated_at = strftime('%s', 'now')
             WHERE id = ?1",
            params![id, chain_id, nft, body],
        )?;
        if changed == 0 {
            return Err(NodeError::NotFound(format!("DDO {}", id)));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> NodeResult<bool> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM ddos WHERE id = ?1", [id])? > 0)
    }

    fn search(&self, query: &Map<String, Value>, page: usize, per_page: usize) -> NodeResult<Vec<Value>> {
        let mut sql = String::from("SELECT body FROM ddos");
        let mut args: Vec<String> = Vec::with_capacity(query.len() * 2);
        for (i, (key, value)) in query.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!(
                "json_extract(body, ?{}) = json_extract(?{}, '$')",
                i * 2 + 1,
                i * 2 + 2
            ));
            args.push(json_path(key)?);
            args.push(serde_json::to_string(value)?);
        }
        let per_page = per_page.max(1);
        let offset = page.saturating_sub(1) * per_page;
        sql.push_str(&format!(" ORDER BY created_at, id LIMIT {} OFFSET {}", per_page, offset));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }

    fn delete_all_from_chain(&self, chain_id: u64) -> NodeResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM ddos WHERE chain_id = ?1", [chain_id as i64])?;
        info!(chain_id, removed, "Deleted DDOs for chain");
        Ok(removed)
    }

    fn ids(&self) -> NodeResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT id FROM ddos ORDER BY created_at, id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, chain: u64, kind: &str) -> Value {
        json!({"id": id, "chainId": chain, "nftAddress": "0xabc", "metadata": {"type": kind}})
    }

    #[test]
    fn test_crud() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        store.create(&doc("did:op:1", 1, "dataset")).unwrap();
        assert!(store.create(&doc("did:op:1", 1, "dataset")).is_err());

        assert_eq!(store.retrieve("did:op:1").unwrap().unwrap()["metadata"]["type"], "dataset");
        assert!(store.retrieve("did:op:missing").unwrap().is_none());

        store.update(&doc("did:op:1", 1, "algorithm")).unwrap();
        assert_eq!(store.retrieve("did:op:1").unwrap().unwrap()["metadata"]["type"], "algorithm");
        assert_eq!(store.update(&doc("did:op:2", 1, "x")).unwrap_err().http_status(), 404);

        assert!(store.delete("did:op:1").unwrap());
        assert!(!store.delete("did:op:1").unwrap());
    }

    #[test]
    fn test_search_and_chain_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteDocumentStore::open(dir.path()).unwrap();
        store.create(&doc("did:op:a", 1, "dataset")).unwrap();
        store.create(&doc("did:op:b", 1, "algorithm")).unwrap();
        store.create(&doc("did:op:c", 2, "dataset")).unwrap();

        let mut query = Map::new();
        query.insert("metadata.type".into(), json!("dataset"));
        let found = store.search(&query, 1, 10).unwrap();
        assert_eq!(found.len(), 2);

        query.insert("chainId".into(), json!(2));
        let found = store.search(&query, 1, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], "did:op:c");

        let mut bad = Map::new();
        bad.insert("x') OR 1=1 --".into(), json!(1));
        assert!(store.search(&bad, 1, 10).is_err());

        assert_eq!(store.delete_all_from_chain(1).unwrap(), 2);
        assert_eq!(store.ids().unwrap(), vec!["did:op:c".to_string()]);
    }
}
