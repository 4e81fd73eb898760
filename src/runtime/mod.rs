//! # Runtime
//!
//! Device selection for the forward pass.

pub mod device;

pub use device::select_device;
