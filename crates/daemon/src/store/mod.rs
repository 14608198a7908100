// Persistence: SQLite meta.db holding scheduled task records.

pub mod meta_db;
pub mod tasks;
