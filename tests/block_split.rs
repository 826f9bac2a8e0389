use delaycast::{assign_ranks, block_boundaries, split, SplitConfig, SplitError};

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-12,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn boundaries_for_five_blocks_at_point_eight() {
    let cfg = SplitConfig {
        num_blocks: 5,
        split_ratio: 0.8,
    };

    let blocks = block_boundaries(&cfg).expect("default split config is valid");

    assert_eq!(blocks.len(), 5);
    let k = 5.0_f64;
    let test_area = 1.0 - (1.0 - 0.8) / k;
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.index, i);
        // Bit-exact: a reordered formula rounds differently.
        assert_eq!(block.train.lower, test_area * i as f64 / k);
        assert_eq!(block.train.upper, test_area * (i + 1) as f64 / k);
        assert_eq!(block.test.lower, block.train.upper);
        assert_eq!(block.test.upper, block.train.upper + (1.0 - 0.8) / k);
    }

    assert_eq!(blocks[0].train.lower, 0.0);
}

#[test]
fn ranks_follow_percent_rank_with_shared_ties() {
    let times = vec![300, 100, 200, 200, 500];

    let ranks = assign_ranks(&times);

    assert_close(ranks[1], 0.0);
    assert_close(ranks[2], 0.25);
    assert_close(ranks[3], 0.25);
    assert_close(ranks[0], 0.75);
    assert_close(ranks[4], 1.0);
}

#[test]
fn single_row_ranks_to_zero() {
    assert_eq!(assign_ranks(&[42]), vec![0.0]);
    assert!(assign_ranks(&[]).is_empty());
}

#[test]
fn training_rows_never_come_after_test_rows() {
    let times: Vec<i64> = (0..101).map(|i| i * 60_000).collect();
    let ranks = assign_ranks(&times);
    let cfg = SplitConfig::default();

    let blocks = split(&ranks, &cfg).expect("split should succeed");

    assert_eq!(blocks.len(), cfg.num_blocks);
    for block in &blocks {
        assert!(!block.train_indices.is_empty());
        assert!(!block.test_indices.is_empty());
        let latest_train = block
            .train_indices
            .iter()
            .map(|&idx| times[idx])
            .max()
            .expect("train rows exist");
        let earliest_test = block
            .test_indices
            .iter()
            .map(|&idx| times[idx])
            .min()
            .expect("test rows exist");
        assert!(
            latest_train < earliest_test,
            "block {} leaks: train {} >= test {}",
            block.boundaries.index,
            latest_train,
            earliest_test
        );
        for &idx in &block.train_indices {
            assert!(!block.test_indices.contains(&idx));
        }
    }
}

#[test]
fn test_blocks_tile_without_overlap() {
    let times: Vec<i64> = (0..251).collect();
    let ranks = assign_ranks(&times);

    let blocks = split(&ranks, &SplitConfig::default()).expect("split should succeed");

    let mut seen = vec![0u32; times.len()];
    for block in &blocks {
        for &idx in &block.test_indices {
            seen[idx] += 1;
        }
    }
    assert!(seen.iter().all(|&hits| hits <= 1));
    // Rank 0 sits on the open lower bound of the first train block.
    assert!(blocks
        .iter()
        .all(|block| !block.train_indices.contains(&0) && !block.test_indices.contains(&0)));
}

#[test]
fn invalid_configs_are_rejected() {
    let zero_blocks = SplitConfig {
        num_blocks: 0,
        split_ratio: 0.8,
    };
    assert_eq!(
        block_boundaries(&zero_blocks).expect_err("zero blocks must fail"),
        SplitError::InvalidBlockCount(0)
    );

    for ratio in [0.0, 1.0, -0.5, f64::NAN] {
        let cfg = SplitConfig {
            num_blocks: 5,
            split_ratio: ratio,
        };
        let err = block_boundaries(&cfg).expect_err("ratio outside (0, 1) must fail");
        assert!(matches!(err, SplitError::InvalidSplitRatio(_)));
    }

    let err = split(&[0.0, 1.5], &SplitConfig::default()).expect_err("rank > 1 must fail");
    assert!(matches!(err, SplitError::InvalidRank { row: 1, .. }));
}
