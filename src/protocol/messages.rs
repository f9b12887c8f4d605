//! Wire message definitions shared by clients, the naming server and storage
//! servers.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::utils::NetFsError;

use serde::{Deserialize, Serialize};

/// Client session ID type, assigned by the naming server.
pub type ClientId = u64;

/// Storage server ID type, assigned by the naming server.
pub type ServerId = u64;

/// Upper bound on the byte length of path, dest and data fields.
pub const MAX_BUFFER_SIZE: usize = 1024;

/// Upper bound on the byte length of a textual IP address.
pub const IP_LENGTH: usize = 16;

/// Request flag: WRITE appends instead of overwriting.
pub const FLAG_APPEND: i32 = 1;

/// Request flag: CREATE makes a directory instead of a file.
pub const FLAG_DIRECTORY: i32 = 1 << 1;

/// Request flag: request is a replica push from a primary storage server.
pub const FLAG_REPLICA: i32 = 1 << 2;

// Helper macro for declaring a wire enum carried as an `i32` code.
macro_rules! wire_code_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
        #[serde(into = "i32", try_from = "i32")]
        pub enum $name {
            $($variant = $code),+
        }

        impl From<$name> for i32 {
            fn from(v: $name) -> i32 {
                v as i32
            }
        }

        impl TryFrom<i32> for $name {
            type Error = NetFsError;

            fn try_from(code: i32) -> Result<Self, Self::Error> {
                match code {
                    $($code => Ok($name::$variant),)+
                    _ => Err(NetFsError(format!(
                        "invalid {} code {}",
                        stringify!($name),
                        code
                    ))),
                }
            }
        }
    };
}

wire_code_enum!(
    /// Operation requested by a client.
    OpCode {
        Read = 1,
        Write = 2,
        Create = 3,
        Delete = 4,
        Info = 5,
        List = 6,
        Move = 7,
        Copy = 8,
        Rename = 9,
    }
);

wire_code_enum!(
    /// Stable error code carried in every response.
    ErrorCode {
        Success = 200,
        PathNotFound = 201,
        InvalidOperation = 202,
        PathExists = 203,
        ServerUnavailable = 204,
        IoFailure = 205,
        ProtocolError = 206,
        InvalidPath = 207,
        CapacityExceeded = 208,
    }
);

wire_code_enum!(
    /// Outcome flag of a response.
    ReplyFlag {
        Success = 0,
        Failure = 1,
        BackupRedirect = 2,
    }
);

impl OpCode {
    /// Whether this operation is served directly by a storage server after
    /// the naming server resolved its address.
    pub fn is_direct(&self) -> bool {
        matches!(self, OpCode::Read | OpCode::Write | OpCode::Info)
    }

    /// Whether this operation takes a second (destination) path.
    pub fn needs_dest(&self) -> bool {
        matches!(self, OpCode::Move | OpCode::Copy | OpCode::Rename)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as i32)
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), NetFsError> {
    if value.len() > max {
        Err(NetFsError(format!(
            "{} length {} exceeds limit {}",
            field,
            value.len(),
            max
        )))
    } else {
        Ok(())
    }
}

/// Request message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Request {
    pub op: OpCode,
    pub client_id: ClientId,
    pub path: String,
    pub flags: i32,

    /// Destination path of COPY/MOVE, or the new name of RENAME.
    pub dest: Option<String>,
}

impl Request {
    pub fn new(op: OpCode, client_id: ClientId, path: impl ToString) -> Self {
        Request {
            op,
            client_id,
            path: path.to_string(),
            flags: 0,
            dest: None,
        }
    }

    pub fn with_flags(mut self, flags: i32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_dest(mut self, dest: impl ToString) -> Self {
        self.dest = Some(dest.to_string());
        self
    }

    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags & flag != 0
    }

    /// Checks field bounds of a received request.
    pub fn validate(&self) -> Result<(), NetFsError> {
        check_len("path", &self.path, MAX_BUFFER_SIZE)?;
        if let Some(dest) = &self.dest {
            check_len("dest", dest, MAX_BUFFER_SIZE)?;
        }
        if self.op.needs_dest() && self.dest.is_none() {
            return Err(NetFsError(format!("{:?} request without dest", self.op)));
        }
        Ok(())
    }
}

/// Response message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Response {
    pub error_code: ErrorCode,
    pub flags: ReplyFlag,
    pub data: String,
}

impl Response {
    pub fn success(data: impl ToString) -> Self {
        Response {
            error_code: ErrorCode::Success,
            flags: ReplyFlag::Success,
            data: data.to_string(),
        }
    }

    pub fn failure(error_code: ErrorCode, data: impl ToString) -> Self {
        Response {
            error_code,
            flags: ReplyFlag::Failure,
            data: data.to_string(),
        }
    }

    /// Redirection to the backup replica listening at `addr`.
    pub fn redirect(addr: SocketAddr) -> Self {
        Response {
            error_code: ErrorCode::Success,
            flags: ReplyFlag::BackupRedirect,
            data: format_addr(addr),
        }
    }

    pub fn is_success(&self) -> bool {
        self.flags == ReplyFlag::Success
    }

    /// Checks field bounds of a received response.
    pub fn validate(&self) -> Result<(), NetFsError> {
        check_len("data", &self.data, MAX_BUFFER_SIZE)
    }

    /// Truncates data to the field bound, on a char boundary.
    pub fn truncated(mut self) -> Self {
        if self.data.len() > MAX_BUFFER_SIZE {
            let mut end = MAX_BUFFER_SIZE;
            while !self.data.is_char_boundary(end) {
                end -= 1;
            }
            self.data.truncate(end);
        }
        self
    }
}

/// Formats a storage server address as the `"ip port"` response payload.
pub fn format_addr(addr: SocketAddr) -> String {
    format!("{} {}", addr.ip(), addr.port())
}

/// Parses an `"ip port"` response payload.
pub fn parse_addr(data: &str) -> Result<SocketAddr, NetFsError> {
    let mut parts = data.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(ip), Some(port), None) => {
            Ok(SocketAddr::new(ip.parse::<IpAddr>()?, port.parse::<u16>()?))
        }
        _ => Err(NetFsError(format!("malformed address payload '{}'", data))),
    }
}

/// Storage server registration payload.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StorageServerInit {
    /// Advertised IP; `0.0.0.0` means "use the address I connect from".
    pub ip: String,
    pub client_port: u16,
    pub ns_port: u16,

    /// Paths exposed by the server, relative to its mount root.
    pub mount_paths: Vec<String>,
}

impl StorageServerInit {
    /// Checks field bounds of a received registration.
    pub fn validate(&self) -> Result<(), NetFsError> {
        check_len("ip", &self.ip, IP_LENGTH)?;
        for path in &self.mount_paths {
            check_len("mount path", path, MAX_BUFFER_SIZE)?;
        }
        Ok(())
    }
}

/// Message on the link between a storage server and the naming server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CtrlMsg {
    /// Storage -> Naming: first message on a new link.
    Register(StorageServerInit),

    /// Naming -> Storage: registration accepted with assigned ID.
    Registered { id: ServerId },

    /// Naming -> Storage: registration refused; link is closed afterwards.
    Rejected { error_code: ErrorCode, reason: String },

    /// Naming -> Storage: client-facing addresses of my backup servers.
    AssignBackups { backups: Vec<(ServerId, SocketAddr)> },

    /// Naming -> Storage: namespace-mutating request to perform.
    Forward { seq: u64, req: Request },

    /// Storage -> Naming: outcome of the forwarded request `seq`.
    Reply { seq: u64, resp: Response },

    /// Storage -> Naming: deregistration notification.
    Leave,

    /// Naming -> Storage: deregistration acknowledged.
    LeaveReply,
}

/// Message from a client to the naming server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ClientMsg {
    Req(Request),
    Leave,
}

/// Message from the naming server to a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum NsReply {
    /// First message of a session, carrying the assigned client ID.
    Welcome { id: ClientId },

    /// Session refused; connection is closed afterwards.
    Rejected { error_code: ErrorCode },

    Reply(Response),

    LeaveReply,
}

#[cfg(test)]
mod messages_tests {
    use super::*;
    use rmp_serde::decode::from_slice;
    use rmp_serde::encode::to_vec;

    #[test]
    fn codes_match_wire_values() -> Result<(), NetFsError> {
        assert_eq!(i32::from(OpCode::Read), 1);
        assert_eq!(i32::from(OpCode::Rename), 9);
        assert_eq!(i32::from(ErrorCode::PathNotFound), 201);
        assert_eq!(OpCode::try_from(6)?, OpCode::List);
        assert!(OpCode::try_from(10).is_err());
        assert!(ErrorCode::try_from(199).is_err());
        assert_eq!(ReplyFlag::try_from(2)?, ReplyFlag::BackupRedirect);
        Ok(())
    }

    #[test]
    fn codes_encode_as_integers() -> Result<(), NetFsError> {
        let bytes = to_vec(&ErrorCode::InvalidOperation)?;
        let code: i32 = from_slice(&bytes)?;
        assert_eq!(code, 202);
        let bad = to_vec(&42i32)?;
        assert!(from_slice::<OpCode>(&bad).is_err());
        Ok(())
    }

    #[test]
    fn request_bounds() {
        let req = Request::new(OpCode::Read, 1, "a".repeat(MAX_BUFFER_SIZE));
        assert!(req.validate().is_ok());
        let req = Request::new(OpCode::Read, 1, "a".repeat(MAX_BUFFER_SIZE + 1));
        assert!(req.validate().is_err());
        let req = Request::new(OpCode::Copy, 1, "/a");
        assert!(req.validate().is_err());
        assert!(req.with_dest("/b").validate().is_ok());
    }

    #[test]
    fn request_flags() {
        let req = Request::new(OpCode::Write, 3, "/f")
            .with_flags(FLAG_APPEND)
            .with_flags(FLAG_REPLICA);
        assert!(req.has_flag(FLAG_APPEND));
        assert!(req.has_flag(FLAG_REPLICA));
        assert!(!req.has_flag(FLAG_DIRECTORY));
    }

    #[test]
    fn addr_payload() -> Result<(), NetFsError> {
        let addr: SocketAddr = "10.0.0.7:9001".parse()?;
        let resp = Response::redirect(addr);
        assert_eq!(resp.data, "10.0.0.7 9001");
        assert_eq!(resp.flags, ReplyFlag::BackupRedirect);
        assert_eq!(parse_addr(&resp.data)?, addr);
        assert!(parse_addr("10.0.0.7").is_err());
        assert!(parse_addr("10.0.0.7 x").is_err());
        Ok(())
    }

    #[test]
    fn truncate_on_char_boundary() {
        let data = "é".repeat(MAX_BUFFER_SIZE);
        let resp = Response::success(data).truncated();
        assert!(resp.data.len() <= MAX_BUFFER_SIZE);
        assert!(resp.validate().is_ok());
    }

    #[test]
    fn init_bounds() {
        let init = StorageServerInit {
            ip: "127.0.0.1".into(),
            client_port: 9000,
            ns_port: 9100,
            mount_paths: vec!["docs".into()],
        };
        assert!(init.validate().is_ok());
        let init = StorageServerInit {
            ip: "1234567890.1234567".into(),
            ..init
        };
        assert!(init.validate().is_err());
    }
}
