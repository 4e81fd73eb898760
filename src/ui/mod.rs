//! # User Interface
//!
//! Colored terminal output mirrored into per-run log files.

pub mod log;

pub use log::{debug, error, format_elapsed, header, info, recall_table, success, warn, Log};
