//! Per-scenario planning databases: a registry of scenarios with a status
//! state machine, per-user access control, request routing to the right
//! physical database, whole-database lifecycle operations, and schema
//! migration across every live scenario.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;

pub use config::AppConfig;
pub use error::AppError;
