use std::time::Duration;

pub const PROTOCOL_NAME: &str = "eth";

pub const ETH66: u32 = 66;
pub const ETH67: u32 = 67;
pub const ETH68: u32 = 68;

/// Supported versions, most preferred first.
pub const PROTOCOL_VERSIONS: [u32; 3] = [ETH68, ETH67, ETH66];

/// Number of message codes each version occupies.
pub const PROTOCOL_LENGTH: u64 = 17;

pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Hard caps on items per request, regardless of measured peer throughput.
pub const MAX_HEADER_FETCH: usize = 192;
pub const MAX_BLOCK_FETCH: usize = 128;
pub const MAX_RECEIPT_FETCH: usize = 256;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
