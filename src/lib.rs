pub mod aggregate;
pub mod backup;
pub mod cache;
pub mod config;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod filter;
pub mod gate;
pub mod index;
pub mod permission;
pub mod query;
pub mod storage;
pub mod transaction;

pub use crate::{
    config::{DbConfig, StorageMode},
    engine::Database,
    error::{DbError, Result},
    permission::Action,
    query::QueryOptions,
};
