//! IPC endpoint of the proxy group manager.
//!
//! Sibling processes deliver proxy relocation events here and query the
//! cache for current assignments, group status and diagnostic counters.
//! The wire format is a little-endian length-prefixed frame carrying a
//! message code and fixed-width fields.

pub mod codec;
pub mod service;

pub use codec::{read_frame, write_frame, Frame};
pub use service::PgmService;

/// Message codes served on the manager's endpoint.
pub const PGM_IPC_PROXY_RELOCATE: u32 = 1;
pub const PGM_IPC_HOST_PROXY: u32 = 2;
pub const PGM_IPC_HOST_PROXY_RESULT: u32 = 3;
pub const PGM_IPC_GROUP_STATUS: u32 = 4;
pub const PGM_IPC_GROUP_STATUS_RESULT: u32 = 5;
pub const PGM_IPC_DIAG_STATS: u32 = 6;
pub const PGM_IPC_DIAG_STATS_RESULT: u32 = 7;
