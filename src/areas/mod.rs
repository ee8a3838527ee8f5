//! Stateful components that own files on disk
//!
//! - `store`: named files under `.fidx/store`
//! - `transaction`: single-writer transactions over the store
//! - `file_index`: the path <-> token index
//! - `repository`: ties the store, configuration and index together for commands

pub mod file_index;
pub mod repository;
pub mod store;
pub mod transaction;
