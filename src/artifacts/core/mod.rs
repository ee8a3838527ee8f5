//! Core utilities and shared types
//!
//! - `clock`: injectable wall-clock used for garbage collection timestamps
//! - `config`: file index configuration and its TOML loader

pub mod clock;
pub mod config;
