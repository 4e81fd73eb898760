//! # Command Implementations
//!
//! Each submodule handles one CLI command.

pub mod eval;
pub mod fetch;
