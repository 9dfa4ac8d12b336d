//! Utilities for testing messaging functionality without real sockets or a real directory
//!  service. They are used for testing the crate itself, but they are also exported for
//!  application testing.

pub mod directory;
pub mod keys;
pub mod network;
