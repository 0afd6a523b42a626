//! SQLite persistence for the kai daemon: a single-writer `Database` wrapper
//! plus one repo per table family.

mod database;
mod error;
mod schema;

pub mod checkpoints;
pub mod memories;
pub mod messages;
pub mod rooms;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
