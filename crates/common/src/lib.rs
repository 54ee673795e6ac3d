//! Common types, wire protocol definitions, and errors shared across `uaserver` crates.

pub mod error;
pub mod protocol;
pub mod status;

pub use error::EndpointError;
pub use protocol::MessageSecurityMode;
pub use status::StatusCode;
