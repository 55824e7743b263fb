//! Database session abstraction
//!
//! A [`Session`] is a small unit-of-work over one database: ensure the schema,
//! stage records, save them in a transaction, read them back. [`Connector`]
//! opens sessions. The TDS-backed implementation lives in [`crate::tds`];
//! [`MemoryConnector`] keeps everything in process for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{LocalDbError, Result};
use crate::files::BackingFiles;
use crate::naming::Identifier;

/// The single entity stored by a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: Uuid,
    pub name: String,
}

impl Record {
    /// New record with a freshly generated id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// What a session is opened against. Instance and database share one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub database: Identifier,
    pub files: BackingFiles,
}

impl Target {
    pub fn new(database: Identifier, files: BackingFiles) -> Self {
        Self { database, files }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>>;
}

#[async_trait]
pub trait Session: Send {
    /// Drop the database if present; returns whether it existed
    async fn ensure_deleted(&mut self) -> Result<bool>;

    /// Create the database and its table if absent; returns whether it was created
    async fn ensure_created(&mut self) -> Result<bool>;

    /// Stage a record for the next [`Session::save_changes`]
    fn add(&mut self, record: Record);

    /// Insert all staged records in one transaction and commit
    async fn save_changes(&mut self) -> Result<usize>;

    /// The one and only record; anything else is a data-integrity error
    async fn single(&mut self) -> Result<Record>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Cardinality check shared by all session implementations
pub fn exactly_one(mut records: Vec<Record>) -> Result<Record> {
    match records.len() {
        1 => Ok(records.remove(0)),
        found => Err(LocalDbError::NotSingle { found }),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    databases: HashMap<String, Vec<Record>>,
    opened: usize,
    open_now: usize,
    peak_open: usize,
}

/// In-process connector for tests
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total sessions ever opened
    pub fn opened(&self) -> usize {
        self.lock().opened
    }

    /// Highest number of sessions open at the same time
    pub fn peak_open(&self) -> usize {
        self.lock().peak_open
    }

    /// Sessions currently open
    pub fn open_now(&self) -> usize {
        self.lock().open_now
    }

    /// Rows currently stored in `database`, if it exists
    pub fn records(&self, database: &str) -> Option<Vec<Record>> {
        self.lock().databases.get(database).cloned()
    }

    /// Put a database in place beforehand, as a previous run might have left it
    pub fn seed_database(&self, database: &str, records: Vec<Record>) {
        self.lock().databases.insert(database.to_string(), records);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>> {
        let mut state = self.lock();
        state.opened += 1;
        state.open_now += 1;
        state.peak_open = state.peak_open.max(state.open_now);

        Ok(Box::new(MemorySession {
            connector: self.clone(),
            database: target.database.to_string(),
            pending: Vec::new(),
        }))
    }
}

struct MemorySession {
    connector: MemoryConnector,
    database: String,
    pending: Vec<Record>,
}

#[async_trait]
impl Session for MemorySession {
    async fn ensure_deleted(&mut self) -> Result<bool> {
        Ok(self.connector.lock().databases.remove(&self.database).is_some())
    }

    async fn ensure_created(&mut self) -> Result<bool> {
        let mut state = self.connector.lock();
        if state.databases.contains_key(&self.database) {
            return Ok(false);
        }
        state.databases.insert(self.database.clone(), Vec::new());
        Ok(true)
    }

    fn add(&mut self, record: Record) {
        self.pending.push(record);
    }

    async fn save_changes(&mut self) -> Result<usize> {
        let mut state = self.connector.lock();
        let rows = state
            .databases
            .get_mut(&self.database)
            .ok_or_else(|| LocalDbError::MissingDatabase {
                name: self.database.clone(),
            })?;
        let saved = self.pending.len();
        rows.append(&mut self.pending);
        Ok(saved)
    }

    async fn single(&mut self) -> Result<Record> {
        let rows = self
            .connector
            .records(&self.database)
            .ok_or_else(|| LocalDbError::MissingDatabase {
                name: self.database.clone(),
            })?;
        exactly_one(rows)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.connector.lock();
        state.open_now = state.open_now.saturating_sub(1);
        Ok(())
    }
}
