//! Chronological block splitting for block-wise cross-validation.
//!
//! Events carry a percent rank over the full timeline. Block `i` of `k`
//! trains on ranks in `(A*i/k, A*(i+1)/k]` and tests on the slice of width
//! `(1 - r)/k` directly after it, with `A = 1 - (1 - r)/k` and `r` the split
//! ratio. Test blocks never overlap and always follow their train block.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub num_blocks: usize,
    pub split_ratio: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            num_blocks: 5,
            split_ratio: 0.8,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<(), SplitError> {
        if self.num_blocks == 0 {
            return Err(SplitError::InvalidBlockCount(self.num_blocks));
        }
        if !self.split_ratio.is_finite() || self.split_ratio <= 0.0 || self.split_ratio >= 1.0 {
            return Err(SplitError::InvalidSplitRatio(self.split_ratio));
        }
        Ok(())
    }
}

/// Half-open rank interval `(lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankBounds {
    pub lower: f64,
    pub upper: f64,
}

impl RankBounds {
    pub fn contains(&self, rank: f64) -> bool {
        rank > self.lower && rank <= self.upper
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockBoundaries {
    pub index: usize,
    pub train: RankBounds,
    pub test: RankBounds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSplit {
    pub boundaries: BlockBoundaries,
    pub train_indices: Vec<usize>,
    pub test_indices: Vec<usize>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("num_blocks must be > 0, got {0}")]
    InvalidBlockCount(usize),
    #[error("split_ratio must lie strictly between 0 and 1, got {0}")]
    InvalidSplitRatio(f64),
    #[error("rank {rank} at row {row} is outside [0, 1]")]
    InvalidRank { row: usize, rank: f64 },
}

/// Boundaries for every block. Callers depend on these exact cutoffs, so the
/// arithmetic is kept in this evaluation order.
pub fn block_boundaries(cfg: &SplitConfig) -> Result<Vec<BlockBoundaries>, SplitError> {
    cfg.validate()?;

    let k = cfg.num_blocks as f64;
    let test_area = 1.0 - (1.0 - cfg.split_ratio) / k;
    let test_block_width = (1.0 - cfg.split_ratio) / k;

    Ok((0..cfg.num_blocks)
        .map(|i| {
            let train = RankBounds {
                lower: test_area * i as f64 / k,
                upper: test_area * (i + 1) as f64 / k,
            };
            let test = RankBounds {
                lower: train.upper,
                upper: train.upper + test_block_width,
            };
            BlockBoundaries {
                index: i,
                train,
                test,
            }
        })
        .collect())
}

/// Percent rank of each timestamp: `(r - 1) / (n - 1)` with `r` the 1-based
/// rank in ascending order. Equal timestamps share the rank of the first.
pub fn assign_ranks(times_ms_utc: &[i64]) -> Vec<f64> {
    let n = times_ms_utc.len();
    let mut ranks = vec![0.0; n];
    if n <= 1 {
        return ranks;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&idx| (times_ms_utc[idx], idx));

    let denom = (n - 1) as f64;
    let mut current_rank = 0usize;
    let mut previous: Option<i64> = None;
    for (position, &idx) in order.iter().enumerate() {
        let t = times_ms_utc[idx];
        if previous != Some(t) {
            current_rank = position;
            previous = Some(t);
        }
        ranks[idx] = current_rank as f64 / denom;
    }
    ranks
}

pub fn split(ranks: &[f64], cfg: &SplitConfig) -> Result<Vec<BlockSplit>, SplitError> {
    let boundaries = block_boundaries(cfg)?;
    if let Some((row, rank)) = ranks
        .iter()
        .copied()
        .enumerate()
        .find(|(_, rank)| !(0.0..=1.0).contains(rank))
    {
        return Err(SplitError::InvalidRank { row, rank });
    }

    let blocks: Vec<BlockSplit> = boundaries
        .into_iter()
        .map(|bounds| BlockSplit {
            boundaries: bounds,
            train_indices: indices_within(ranks, &bounds.train),
            test_indices: indices_within(ranks, &bounds.test),
        })
        .collect();

    for block in &blocks {
        info!(
            component = "split",
            event = "split.block.built",
            block = block.boundaries.index,
            train_lower = block.boundaries.train.lower,
            train_upper = block.boundaries.train.upper,
            test_lower = block.boundaries.test.lower,
            test_upper = block.boundaries.test.upper,
            train_rows = block.train_indices.len(),
            test_rows = block.test_indices.len()
        );
    }

    Ok(blocks)
}

fn indices_within(ranks: &[f64], bounds: &RankBounds) -> Vec<usize> {
    ranks
        .iter()
        .enumerate()
        .filter(|(_, rank)| bounds.contains(**rank))
        .map(|(idx, _)| idx)
        .collect()
}
