//! `atlas-store` — SQLite persistence for the MindAtlas backend.
//!
//! # Overview
//!
//! One [`Store`] wraps a mutex-guarded connection and exposes the
//! repositories the pipelines need:
//!
//! - entries / entry types / tags / relations ([`entry`])
//! - attachments and their parse lifecycle ([`attachment`])
//! - the three outbox tables with lease-based claiming ([`outbox`])
//! - conversations and messages for chat replay ([`conversation`])
//! - AI credentials / models / component bindings ([`registry`])
//! - assistant tool and skill configuration ([`assistant_config`])
//!
//! Outbox rows are enqueued inside the same transaction as the business
//! write, claimed with lease semantics (`locked_by`/`locked_at` +
//! TTL-based crash recovery), and acked only by the lock owner.

pub mod assistant_config;
pub mod attachment;
pub mod conversation;
pub mod db;
pub mod entry;
pub mod error;
pub mod outbox;
pub mod registry;

use std::sync::{Arc, Mutex};

use rusqlite::Connection;

pub use error::{Result, StoreError};

/// Shared handle to the SQLite database.
///
/// Cloning is cheap; all clones serialize on the same connection, which
/// also gives claim queries their required atomicity.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        db::init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        db::init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}
