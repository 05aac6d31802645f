//! CLI command implementations.

pub mod compact;
pub mod diff;
pub mod dump_oplog;
pub mod inspect;
pub mod recover;
pub mod verify;
