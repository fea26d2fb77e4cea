use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::schema;
use crate::{Error, Result};

/// Handle on the relational store. One `Store` wraps one SQLite connection
/// behind a mutex so async stages holding the store across await points stay
/// `Send`. Concurrent workers (e.g. the batched summary tasks) call
/// [`Store::reopen`] to get an independent connection and therefore an
/// independent transaction scope against the same database file.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        // WAL so a writer does not starve the concurrent summary connections.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(db_path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// A fresh connection to the same database file.
    pub fn reopen(&self) -> Result<Self> {
        match &self.path {
            Some(path) => Self::open(path),
            None => Err(Error::Query(
                "cannot reopen an in-memory store".to_string(),
            )),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lock the connection. Callers pass `&store.conn()` into the query
    /// functions; do not call this again while a guard (or a transaction) is
    /// alive.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    /// Stage 2 scopes one cluster's apply step (nodes + topic update + period
    /// heat + status flips) to a single call.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn();
        let tx = guard.unchecked_transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Drop rolls the transaction back.
                Err(err)
            }
        }
    }
}
