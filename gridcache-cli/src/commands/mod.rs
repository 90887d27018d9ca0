//! CLI command implementations.

pub mod common;
pub mod config;
pub mod fingerprint;
pub mod populate;
pub mod status;
pub mod tile;
