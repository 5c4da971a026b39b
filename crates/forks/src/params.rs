/// Maximum number of uncles per block.
pub const MAX_UNCLES: usize = 2;

/// Maximum uncle depth (uncle block number must be within this many blocks of the including block).
pub const MAX_UNCLE_DEPTH: u64 = 7;

/// Minimum difficulty.
pub const MIN_DIFFICULTY: u64 = 131_072;

/// Difficulty bound divisor.
pub const DIFFICULTY_BOUND_DIVISOR: u64 = 2048;

/// Target block time in seconds used by the difficulty adjustment.
pub const TARGET_BLOCK_TIME: u64 = 3;

/// Maximum size of header extra data.
pub const MAXIMUM_EXTRA_DATA_SIZE: usize = 32;

/// Gas needed by a plain value transfer.
pub const TX_GAS: u64 = 21_000;

/// Gas needed by a contract creation.
pub const TX_GAS_CONTRACT_CREATION: u64 = 53_000;

/// Per-byte calldata costs.
pub const TX_DATA_ZERO_GAS: u64 = 4;
pub const TX_DATA_NON_ZERO_GAS: u64 = 16;

/// The bound divisor of the gas limit, used in update calculations.
pub const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;

/// Minimum the gas limit may ever be.
pub const MIN_GAS_LIMIT: u64 = 5000;

/// Maximum the gas limit may ever be.
pub const MAX_GAS_LIMIT: u64 = 0x7fff_ffff_ffff_ffff;

/// Base fee of the first London block.
pub const INITIAL_BASE_FEE: u64 = 1_000_000_000;

/// Bounds the amount the base fee can change between blocks.
pub const BASE_FEE_CHANGE_DENOMINATOR: u64 = 8;

/// Bounds the maximum gas limit an EIP-1559 block may have.
pub const ELASTICITY_MULTIPLIER: u64 = 2;

/// Seconds a header timestamp may lie in the future.
pub const ALLOWED_FUTURE_BLOCK_TIME: u64 = 3;

pub const WEI_PER_GWEI: u64 = 1_000_000_000;
pub const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;
