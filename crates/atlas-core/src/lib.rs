//! `atlas-core` — shared foundation for the MindAtlas backend.
//!
//! Holds the pieces every other crate needs: the layered configuration
//! (TOML file + `ATLAS_*` env overrides), the error type with its HTTP
//! envelope code mapping, the shared domain records, the UTC clock
//! helper, and API-key encryption at rest.

pub mod config;
pub mod crypto;
pub mod error;
pub mod response;
pub mod time;
pub mod types;

pub use config::AtlasConfig;
pub use error::{AtlasError, Result};
pub use time::utc_now;
