//! Database module for LinkGuardian.
//!
//! Provides SQLite storage for links, clicks, health checks and notifications.

mod models;
mod store;

pub use models::*;
pub use store::*;
