//! The `eth` wire protocol surface used by the downloader: message codes,
//! status handshake validation and typed request/response packets.

pub mod constants;
pub mod error;
pub mod eth;

pub use error::Error;
pub use eth::{
    check_status_message, ForkFilter, ForkId, ForkIdError, HandshakeError, HashOrNumber, Request, Response,
    ResponsePayload, Status,
};
