//! Permission auto-resolution: mode policy first, then remembered choices.

pub mod memory;
pub mod mode;

pub use memory::{input_hash, PermissionMemory};
pub use mode::{ModePolicy, PermissionMode, DENY_ALL_REASON};
