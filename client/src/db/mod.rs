//! Storage backends for the local store.

mod memory;
pub mod migrations;
mod pool;
mod sqlite;

pub use memory::*;
pub use migrations::{migrate, Migration, MigrationKind, CURRENT_SCHEMA_VERSION, MIGRATIONS};
pub use pool::*;
pub use sqlite::*;
