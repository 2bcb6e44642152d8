// billing-core: the multi-layer cache hierarchy, database connection pool,
// device connection pool, and the registry that wires them together for a
// network-billing backend.
//
// This crate implements the infrastructure substrate only — billing
// semantics, wire protocols, and UI-visible behavior live in the
// surrounding service.

pub mod cache;
pub mod config;
pub mod cron;
pub mod db;
pub mod device;
pub mod error;
pub mod events;
pub mod jobqueue;
pub mod registry;
pub mod telemetry;

pub use config::BillingConfig;
pub use error::{Error, ErrorKind, Result};
