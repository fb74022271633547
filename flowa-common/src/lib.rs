//! # flowa common library
//!
//! Shared code for the flowa workspace:
//! - Common error type
//! - Bootstrap configuration file resolution and TOML loading
//! - SEED station codes with wildcard matching
//! - Iteration / step / model tags
//! - C-style scientific number formatting for solver files

pub mod config;
pub mod error;
pub mod format;
pub mod seed;
pub mod tags;

pub use error::{Error, Result};
pub use seed::StationCode;
