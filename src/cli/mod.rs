//! CLI command implementations
//!
//! This module contains the implementation of all CLI subcommands.

pub mod connect;
pub mod probe;
