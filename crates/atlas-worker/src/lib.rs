//! `atlas-worker` — leased outbox workers.
//!
//! One process runs one worker per pipeline:
//!
//! - [`index_worker::IndexWorker`] drains the entry and attachment
//!   index outboxes into the KG through the indexer adapter
//! - [`parse_worker::ParseWorker`] extracts text from uploaded
//!   attachments and hands off to the index pipeline
//!
//! Workers poll, claim a batch under a lease, process rows one by one
//! (a row failure never aborts its batch), and ack with
//! success/retry/dead per the backoff policy. Shutdown is cooperative:
//! on signal the current batch drains and claimed-but-unfinished rows
//! are reclaimed by lock TTL.
//!
//! [`ingest::AttachmentIngest`] sits on the write side of the same
//! pipeline: upload (validate → put → insert, with object rollback on
//! a failed metadata write) and delete paths that keep the object
//! store consistent with the rows.

pub mod config;
pub mod index_worker;
pub mod ingest;
pub mod parse_worker;
pub mod parser;
pub mod storage;

pub use config::WorkerConfig;
pub use index_worker::IndexWorker;
pub use ingest::AttachmentIngest;
pub use parse_worker::ParseWorker;
