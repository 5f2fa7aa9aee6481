//! CLI command implementations.

pub mod drain;
