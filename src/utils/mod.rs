//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::NetFsError;
pub use print::logger_init;
pub use safetcp::{
    safe_tcp_read, safe_tcp_read_frame, tcp_bind_with_retry,
    tcp_connect_with_retry, tcp_write_frame, tcp_write_obj, MAX_FRAME_LEN,
};
