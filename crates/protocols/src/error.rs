use thiserror::Error;

use crate::eth::HandshakeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message too long: {0} bytes")]
    MsgTooLarge(usize),
    #[error("invalid message: {0}")]
    Decode(String),
    #[error("invalid message code: {0:#x}")]
    InvalidMsgCode(u64),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("peer connection closed")]
    PeerClosed,
    #[error("request {0} already closed")]
    RequestClosed(u64),
}
