// SQLite relational store for the trendpulse pipeline.
// The source of truth for item status transitions; the vector index is a
// derived copy living in trendpulse-vector.

mod db;
mod error;
pub mod queries;
mod schema;

pub use db::Store;
pub use error::{Error, Result};
pub use schema::SCHEMA_VERSION;
