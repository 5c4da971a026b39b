use std::time::Duration;

use alloy_primitives::Address;
use forks::params::WEI_PER_GWEI;
use serde::Deserialize;

/// Block production settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Receives block rewards and fees. Mining refuses to start while zero.
    pub etherbase: Address,
    /// Stamped into the header of every produced block.
    #[serde(with = "extra_hex")]
    pub extra_data: Vec<u8>,
    /// Gas limit the produced blocks converge towards.
    pub gas_ceil: u64,
    /// Minimum tip (wei) of remote transactions included in mined blocks.
    /// Local transactions are exempt.
    pub gas_price: u64,
    /// Time between rebuilds of the sealing work when new transactions arrive.
    #[serde(with = "duration_millis")]
    pub recommit: Duration,
    /// Upper bound for filling a payload requested through `build_payload`.
    #[serde(with = "duration_millis")]
    pub new_payload_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            etherbase: Address::ZERO,
            extra_data: Vec::new(),
            gas_ceil: 250_000_000,
            gas_price: WEI_PER_GWEI,
            recommit: Duration::from_secs(2),
            new_payload_timeout: Duration::from_secs(2),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod extra_hex {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(D::Error::custom)
    }
}
