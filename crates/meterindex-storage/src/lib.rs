//! meterindex-storage: storage backends for MeterIndex.
//!
//! Backends:
//! - [`memory`]: in-memory, every repository trait (dev/testing, no persistence)
//! - [`sqlite`]: SQLite via `sqlx` for heads and transfers (feature `sqlite`)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
