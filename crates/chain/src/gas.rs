use alloy_primitives::U256;
use forks::params::{GAS_LIMIT_BOUND_DIVISOR, INITIAL_BASE_FEE, MIN_GAS_LIMIT};
use forks::ChainConfig;

use crate::types::Header;

/// Gas limit of the block after one with `parent_gas_limit`, moving toward
/// `desired` by at most 1/1024 of the parent limit.
pub fn calc_gas_limit(parent_gas_limit: u64, desired: u64) -> u64 {
    let delta = (parent_gas_limit / GAS_LIMIT_BOUND_DIVISOR).saturating_sub(1);
    let desired = desired.max(MIN_GAS_LIMIT);
    let mut limit = parent_gas_limit;
    if limit < desired {
        limit = (parent_gas_limit + delta).min(desired);
        return limit;
    }
    if limit > desired {
        limit = (parent_gas_limit - delta).max(desired);
    }
    limit
}

/// Base fee of the child of `parent` (EIP-1559).
pub fn calc_base_fee(config: &ChainConfig, parent: &Header) -> U256 {
    if !config.is_london(parent.number) {
        return U256::from(INITIAL_BASE_FEE);
    }
    let parent_base_fee = parent.base_fee.unwrap_or(U256::from(INITIAL_BASE_FEE));
    let target = parent.gas_limit / config.elasticity_multiplier;
    if target == 0 || parent.gas_used == target {
        return parent_base_fee;
    }
    let denominator = U256::from(config.base_fee_change_denominator);
    let target_u = U256::from(target);
    if parent.gas_used > target {
        let used_delta = U256::from(parent.gas_used - target);
        let delta = (parent_base_fee * used_delta / target_u / denominator).max(U256::from(1));
        parent_base_fee + delta
    } else {
        let used_delta = U256::from(target - parent.gas_used);
        let delta = parent_base_fee * used_delta / target_u / denominator;
        parent_base_fee.saturating_sub(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_limit_moves_toward_target() {
        let parent = 8_000_000;
        let step = parent / GAS_LIMIT_BOUND_DIVISOR - 1;
        assert_eq!(calc_gas_limit(parent, 30_000_000), parent + step);
        assert_eq!(calc_gas_limit(parent, 1_000_000), parent - step);
        assert_eq!(calc_gas_limit(parent, parent + 10), parent + 10);
        assert_eq!(calc_gas_limit(parent, parent), parent);
    }

    #[test]
    fn base_fee_first_london_block() {
        let config = ChainConfig {
            london_block: Some(10),
            ..Default::default()
        };
        let parent = Header {
            number: 9,
            ..Default::default()
        };
        assert_eq!(calc_base_fee(&config, &parent), U256::from(INITIAL_BASE_FEE));
    }

    #[test]
    fn base_fee_tracks_usage() {
        let config = ChainConfig {
            london_block: Some(0),
            ..Default::default()
        };
        let mut parent = Header {
            number: 5,
            gas_limit: 20_000_000,
            gas_used: 10_000_000,
            base_fee: Some(U256::from(1_000_000_000u64)),
            ..Default::default()
        };
        assert_eq!(calc_base_fee(&config, &parent), U256::from(1_000_000_000u64));
        parent.gas_used = 20_000_000;
        assert_eq!(calc_base_fee(&config, &parent), U256::from(1_125_000_000u64));
        parent.gas_used = 0;
        assert_eq!(calc_base_fee(&config, &parent), U256::from(875_000_000u64));
    }
}
