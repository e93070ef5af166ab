//! SQLite store for VM metadata kept outside the hypervisor.
//!
//! Each VM record carries the host key captured when the VM was created,
//! which SSH clients use instead of the system known_hosts.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("VM metadata not found: {0}")]
    NotFound(String),
}

/// Metadata of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub name: String,
    pub id: u32,
    pub mac: String,
    /// Public host key in `known_hosts` key format (`ssh-rsa AAAA...`).
    pub host_key: String,
    /// User for SSH sessions.
    pub user_name: String,
    pub static_dhcp: bool,
    /// Volumes created for the VM, boot volume first.
    pub volumes: Vec<String>,
    /// Created timestamp (Unix seconds).
    pub created_at: i64,
}

/// SQLite metadata store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

const COLUMNS: &str = "name, id, mac, host_key, user_name, static_dhcp, volumes, created_at";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<VmRecord> {
    let volumes: String = row.get(6)?;
    let volumes = serde_json::from_str(&volumes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(VmRecord {
        name: row.get(0)?,
        id: row.get(1)?,
        mac: row.get(2)?,
        host_key: row.get(3)?,
        user_name: row.get(4)?,
        static_dhcp: row.get(5)?,
        volumes,
        created_at: row.get(7)?,
    })
}

impl StateStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // Several virter processes may share the file.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                name TEXT PRIMARY KEY,
                id INTEGER NOT NULL,
                mac TEXT NOT NULL,
                host_key TEXT NOT NULL,
                user_name TEXT NOT NULL,
                static_dhcp INTEGER NOT NULL DEFAULT 0,
                volumes TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_vms_mac ON vms(mac);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Insert or replace the record of a VM.
    pub fn put_vm(&self, record: &VmRecord) -> Result<(), StateStoreError> {
        let volumes = serde_json::to_string(&record.volumes)?;
        self.conn().execute(
            r#"
            INSERT INTO vms (name, id, mac, host_key, user_name, static_dhcp, volumes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(name) DO UPDATE SET
                id = excluded.id,
                mac = excluded.mac,
                host_key = excluded.host_key,
                user_name = excluded.user_name,
                static_dhcp = excluded.static_dhcp,
                volumes = excluded.volumes,
                created_at = excluded.created_at
            "#,
            params![
                record.name,
                record.id,
                record.mac,
                record.host_key,
                record.user_name,
                record.static_dhcp,
                volumes,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_vm(&self, name: &str) -> Result<Option<VmRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM vms WHERE name = ?1"))?;
        let record = stmt.query_row(params![name], record_from_row).optional()?;
        Ok(record)
    }

    /// Like [`get_vm`](Self::get_vm), but a missing record is an error.
    pub fn require_vm(&self, name: &str) -> Result<VmRecord, StateStoreError> {
        self.get_vm(name)?
            .ok_or_else(|| StateStoreError::NotFound(name.to_string()))
    }

    /// The VM registered with `mac`, if any.
    pub fn find_by_mac(&self, mac: &str) -> Result<Option<VmRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM vms WHERE mac = ?1"))?;
        let record = stmt.query_row(params![mac.to_lowercase()], record_from_row).optional()?;
        Ok(record)
    }

    /// Delete the record of a VM. Deleting a missing record succeeds.
    pub fn delete_vm(&self, name: &str) -> Result<(), StateStoreError> {
        self.conn()
            .execute("DELETE FROM vms WHERE name = ?1", params![name])?;
        Ok(())
    }

    pub fn list_vms(&self) -> Result<Vec<VmRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM vms ORDER BY name"))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, id: u32) -> VmRecord {
        VmRecord {
            name: name.to_string(),
            id,
            mac: virter_networking::mac_for_id(id),
            host_key: "ssh-rsa AAAAB3NzaC1yc2E".to_string(),
            user_name: "root".to_string(),
            static_dhcp: false,
            volumes: vec![name.to_string(), format!("{name}-cidata")],
            created_at: 1000,
        }
    }

    #[test]
    fn test_vm_records() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_vm(&record("a", 10)).unwrap();
        store.put_vm(&record("b", 11)).unwrap();

        let fetched = store.get_vm("a").unwrap().unwrap();
        assert_eq!(fetched, record("a", 10));

        let by_mac = store
            .find_by_mac(&virter_networking::mac_for_id(11).to_uppercase())
            .unwrap()
            .unwrap();
        assert_eq!(by_mac.name, "b");

        let names: Vec<_> = store.list_vms().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        store.delete_vm("a").unwrap();
        store.delete_vm("a").unwrap();
        assert!(store.get_vm("a").unwrap().is_none());
        assert!(matches!(
            store.require_vm("a"),
            Err(StateStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_upsert_replaces() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_vm(&record("a", 10)).unwrap();
        let mut updated = record("a", 12);
        updated.host_key = "ssh-rsa other".to_string();
        store.put_vm(&updated).unwrap();
        assert_eq!(store.get_vm("a").unwrap().unwrap(), updated);
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("virter.db");
        {
            let store = StateStore::open(&path).unwrap();
            store.put_vm(&record("a", 1)).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_vms().unwrap().len(), 1);
    }
}
