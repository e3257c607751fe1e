//! Repository layer
//!
//! Handles all database operations. Repositories are free async functions
//! over connections; business rules live in the service layer.

pub mod app;
pub mod run;
pub mod run_config;
pub mod runner;
pub mod state;

/// Portable unique-constraint classification
///
/// Losing the single-active-run race surfaces as a unique violation; callers
/// must not match on driver-specific error numbers or message text.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
