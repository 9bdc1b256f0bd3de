//! Data layer module
//!
//! All persistence goes through [`Database`]; the unique-identity
//! invariants the federation handlers rely on live there.

mod database;
mod models;

pub use database::Database;
pub use models::*;
