//! Client side: naming server session, storage server data sessions, and
//! the endpoint tying them together.

mod apistub;
mod endpoint;

pub use apistub::{DataStub, NamingStub};
pub use endpoint::{ClientConfig, ClientEndpoint, ProbeStatus};
