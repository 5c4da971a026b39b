use alloy_primitives::U256;
use chain::types::{empty_uncle_hash, Header};
use forks::params::{DIFFICULTY_BOUND_DIVISOR, MIN_DIFFICULTY, TARGET_BLOCK_TIME};

/// Calculate the expected difficulty of a block at `timestamp` given its parent.
///
/// Tuned for a ~3 second block target:
///   Y = 2 if parent has uncles, 1 otherwise
///   diff = parent.diff + parent.diff / 2048 * max(Y - (timestamp - parent.timestamp) / 3, -99)
///
/// The result never drops below the minimum difficulty.
pub fn calculate_difficulty(parent: &Header, timestamp: u64) -> U256 {
    let min_diff = U256::from(MIN_DIFFICULTY);
    let parent_diff = parent.difficulty;
    let adjustment = parent_diff / U256::from(DIFFICULTY_BOUND_DIVISOR);

    let time_diff = timestamp.saturating_sub(parent.timestamp);
    let x = (time_diff / TARGET_BLOCK_TIME).min(i64::MAX as u64) as i64;
    let y = if parent.uncle_hash == empty_uncle_hash() {
        1i64
    } else {
        2i64
    };
    let sigma = (y - x).max(-99);

    let diff = if sigma >= 0 {
        parent_diff + adjustment * U256::from(sigma as u64)
    } else {
        parent_diff.saturating_sub(adjustment * U256::from(sigma.unsigned_abs()))
    };
    diff.max(min_diff)
}

/// Validate that a header's difficulty matches the expected value.
pub fn validate_difficulty(header: &Header, parent: &Header) -> Result<(), DifficultyError> {
    let expected = calculate_difficulty(parent, header.timestamp);
    if header.difficulty != expected {
        return Err(DifficultyError::Mismatch {
            expected,
            actual: header.difficulty,
            block_number: header.number,
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DifficultyError {
    #[error("invalid difficulty at block {block_number}: have {actual}, want {expected}")]
    Mismatch {
        expected: U256,
        actual: U256,
        block_number: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    fn make_header(number: u64, timestamp: u64, difficulty: u64) -> Header {
        Header {
            number,
            timestamp,
            difficulty: U256::from(difficulty),
            ..Default::default()
        }
    }

    #[test]
    fn difficulty_increases_when_block_is_fast() {
        // 2s < 3s target: sigma = 1 - 0 = 1
        let parent = make_header(100, 1000, 2_048_000);
        assert_eq!(calculate_difficulty(&parent, 1002), U256::from(2_049_000u64));
    }

    #[test]
    fn difficulty_holds_at_target() {
        // 3s: sigma = 1 - 1 = 0
        let parent = make_header(100, 1000, 2_048_000);
        assert_eq!(calculate_difficulty(&parent, 1003), U256::from(2_048_000u64));
    }

    #[test]
    fn difficulty_decreases_when_block_is_slow() {
        // 9s: sigma = 1 - 3 = -2
        let parent = make_header(100, 1000, 2_048_000);
        assert_eq!(calculate_difficulty(&parent, 1009), U256::from(2_046_000u64));
    }

    #[test]
    fn uncles_raise_the_adjustment() {
        let mut parent = make_header(100, 1000, 2_048_000);
        parent.uncle_hash = B256::repeat_byte(1);
        // sigma = 2 - 1 = 1
        assert_eq!(calculate_difficulty(&parent, 1003), U256::from(2_049_000u64));
    }

    #[test]
    fn difficulty_never_below_minimum() {
        let parent = make_header(100, 1000, MIN_DIFFICULTY);
        assert_eq!(calculate_difficulty(&parent, 5000), U256::from(MIN_DIFFICULTY));
    }

    #[test]
    fn adjustment_is_capped_at_minus_99() {
        let parent = make_header(100, 0, 204_800_000);
        // 100_000 / 2048 * 99 subtracted at most
        let expected = U256::from(204_800_000u64 - 100_000 * 99);
        assert_eq!(calculate_difficulty(&parent, 1_000_000), expected);
    }

    #[test]
    fn validate_rejects_wrong_difficulty() {
        let parent = make_header(100, 1000, 2_048_000);
        let mut header = make_header(101, 1003, 2_048_000);
        assert!(validate_difficulty(&header, &parent).is_ok());
        header.difficulty = U256::from(1);
        assert!(matches!(
            validate_difficulty(&header, &parent),
            Err(DifficultyError::Mismatch { block_number: 101, .. })
        ));
    }
}
