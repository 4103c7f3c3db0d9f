//! CLI command implementations.

pub mod inspect_wal;
pub mod restore;
pub mod status;
