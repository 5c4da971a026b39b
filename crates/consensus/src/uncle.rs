use std::collections::HashSet;

use alloy_primitives::B256;
use chain::types::{compute_uncle_hash, Header};
use forks::params::{MAX_UNCLES, MAX_UNCLE_DEPTH};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UncleRuleError {
    #[error("too many uncles: {count} > {max}", max = MAX_UNCLES)]
    TooMany { count: usize },

    #[error("uncle hash mismatch: header {declared}, body {computed}")]
    HashMismatch { declared: B256, computed: B256 },

    #[error("uncle {uncle_number} outside the window of block {block_number}")]
    OutOfWindow { uncle_number: u64, block_number: u64 },

    #[error("duplicate uncle {0}")]
    Duplicate(B256),

    #[error("uncle {0} is an ancestor")]
    Ancestor(B256),
}

/// Check a block's uncle list.
///
/// Uncles are never rewarded, so only the structural limits apply: at most
/// [`MAX_UNCLES`], committed by the header's uncle hash, between 1 and
/// [`MAX_UNCLE_DEPTH`] blocks older than the including block, distinct, and
/// none of them an ancestor (or a previously included uncle) in `known`.
pub fn check_uncles(
    header: &Header,
    uncles: &[Header],
    known: &HashSet<B256>,
) -> Result<(), UncleRuleError> {
    if uncles.len() > MAX_UNCLES {
        return Err(UncleRuleError::TooMany {
            count: uncles.len(),
        });
    }
    let computed = compute_uncle_hash(uncles);
    if computed != header.uncle_hash {
        return Err(UncleRuleError::HashMismatch {
            declared: header.uncle_hash,
            computed,
        });
    }

    let mut seen = HashSet::with_capacity(uncles.len());
    for uncle in uncles {
        let hash = uncle.hash();
        let depth = header.number.saturating_sub(uncle.number);
        if depth == 0 || depth > MAX_UNCLE_DEPTH {
            return Err(UncleRuleError::OutOfWindow {
                uncle_number: uncle.number,
                block_number: header.number,
            });
        }
        if !seen.insert(hash) {
            return Err(UncleRuleError::Duplicate(hash));
        }
        if known.contains(&hash) {
            return Err(UncleRuleError::Ancestor(hash));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64, extra: u8) -> Header {
        Header {
            number,
            timestamp: 1_000 + number * 3,
            extra_data: vec![extra],
            ..Default::default()
        }
    }

    fn including(number: u64, uncles: &[Header]) -> Header {
        Header {
            uncle_hash: compute_uncle_hash(uncles),
            ..header(number, 0)
        }
    }

    #[test]
    fn accepts_recent_uncles() {
        let uncles = [header(99, 1), header(93, 2)];
        let block = including(100, &uncles);
        assert_eq!(check_uncles(&block, &uncles, &HashSet::new()), Ok(()));
        assert_eq!(check_uncles(&including(100, &[]), &[], &HashSet::new()), Ok(()));
    }

    #[test]
    fn rejects_three_uncles() {
        let uncles = [header(99, 1), header(98, 2), header(97, 3)];
        let block = including(100, &uncles);
        assert_eq!(
            check_uncles(&block, &uncles, &HashSet::new()),
            Err(UncleRuleError::TooMany { count: 3 })
        );
    }

    #[test]
    fn rejects_out_of_window() {
        for number in [92, 100, 101] {
            let uncles = [header(number, 1)];
            let block = including(100, &uncles);
            assert!(matches!(
                check_uncles(&block, &uncles, &HashSet::new()),
                Err(UncleRuleError::OutOfWindow { .. })
            ));
        }
    }

    #[test]
    fn rejects_duplicates_and_ancestors() {
        let uncle = header(99, 1);
        let twice = [uncle.clone(), uncle.clone()];
        assert_eq!(
            check_uncles(&including(100, &twice), &twice, &HashSet::new()),
            Err(UncleRuleError::Duplicate(uncle.hash()))
        );

        let once = [uncle.clone()];
        let known = HashSet::from([uncle.hash()]);
        assert_eq!(
            check_uncles(&including(100, &once), &once, &known),
            Err(UncleRuleError::Ancestor(uncle.hash()))
        );
    }

    #[test]
    fn rejects_uncommitted_uncles() {
        let uncles = [header(99, 1)];
        assert!(matches!(
            check_uncles(&including(100, &[]), &uncles, &HashSet::new()),
            Err(UncleRuleError::HashMismatch { .. })
        ));
    }
}
