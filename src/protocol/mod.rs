//! Request/response protocol spoken between clients, the naming server and
//! storage servers.

mod messages;
mod stream;

pub use messages::{
    format_addr, parse_addr, ClientId, ClientMsg, CtrlMsg, ErrorCode, NsReply,
    OpCode, ReplyFlag, Request, Response, ServerId, StorageServerInit,
    FLAG_APPEND, FLAG_DIRECTORY, FLAG_REPLICA, IP_LENGTH, MAX_BUFFER_SIZE,
};
pub use stream::{
    new_stop_sequence, recv_stream, send_stream, StreamEnd,
    DEFAULT_CHUNK_SIZE, STOP_SEQUENCE_LEN,
};

use crate::namespace::normalize_path;
use crate::utils::NetFsError;

/// Name of the directory under a storage server's root that holds replicas
/// pushed by the servers it backs up.
pub const BACKUP_DIR: &str = "backup";

/// Rewrites a client path into the path of its replica on a backup server,
/// e.g. `/docs/readme.txt` -> `./backup/docs/readme.txt`.
pub fn backup_path(path: &str) -> Result<String, NetFsError> {
    Ok(format!("./{}/{}", BACKUP_DIR, normalize_path(path)?))
}

#[cfg(test)]
mod backup_path_tests {
    use super::*;

    #[test]
    fn rewrite_to_backup() -> Result<(), NetFsError> {
        assert_eq!(
            backup_path("/docs/readme.txt")?,
            "./backup/docs/readme.txt"
        );
        assert_eq!(backup_path("docs/a")?, "./backup/docs/a");
        assert!(backup_path("/../x").is_err());
        Ok(())
    }
}
