//! Process exit codes.

pub const SUCCESS: i32 = 0;
pub const ACTION_FAILED: i32 = 1; // Annotation/rerun rejected or partially delivered
pub const CONFIG_ERROR: i32 = 2; // Unreadable fixture/config, unknown run
