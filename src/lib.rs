//! netfs: a distributed network file system. A naming server owns a
//! trie-indexed namespace mapping paths to storage servers; clients resolve
//! paths there and move file data directly with the storage servers, which
//! replicate to their backups.

#[macro_use]
mod utils;

pub mod client;
pub mod namespace;
pub mod naming;
pub mod protocol;
pub mod storage;

// Helper utilities and macros exports
pub use crate::utils::{logger_init, NetFsError, MAX_FRAME_LEN};

// Public interface exports
pub use crate::client::{
    ClientConfig, ClientEndpoint, DataStub, NamingStub, ProbeStatus,
};
pub use crate::naming::{NamingConfig, NamingServer};
pub use crate::protocol::{
    ClientId, ErrorCode, OpCode, ReplyFlag, Request, Response, ServerId,
};
pub use crate::storage::{StorageConfig, StorageServer};
