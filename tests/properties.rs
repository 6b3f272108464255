//! Property tests for the numeric building blocks.

use proptest::prelude::*;

use driftwatch::adaptive::{compute_window_sizes, AdaptiveWindowConfig, StreamCharacteristics};
use driftwatch::autotune::{
    evaluate, AutoTuneConfig, FeedbackStats, Thresholds, NCD_THRESHOLD_BOUNDS,
    P_VALUE_THRESHOLD_BOUNDS,
};
use driftwatch::compression::{backend, CompressionAlgorithm};
use driftwatch::metrics::entropy::shannon_entropy;
use driftwatch::metrics::ncd::ncd;
use driftwatch::metrics::permutation::PermutationSignificanceTester;
use driftwatch::numeric::NumericStats;
use driftwatch::tokenizer::{Tokenizer, TokenizerConfig};

fn algorithm() -> impl Strategy<Value = CompressionAlgorithm> {
    prop_oneof![
        Just(CompressionAlgorithm::Zlib),
        Just(CompressionAlgorithm::Gzip),
        Just(CompressionAlgorithm::Lz4),
    ]
}

fn events(max: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 2..max)
}

proptest! {
    #[test]
    fn ncd_is_bounded(
        a in prop::collection::vec(any::<u8>(), 1..2048),
        b in prop::collection::vec(any::<u8>(), 1..2048),
        algo in algorithm(),
    ) {
        let d = ncd(&a, &b, backend(algo).as_ref()).unwrap();
        prop_assert!((0.0..=1.0).contains(&d));
    }

    #[test]
    fn entropy_is_bounded(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let h = shannon_entropy(&data);
        prop_assert!((0.0..=8.0).contains(&h));
    }

    #[test]
    fn constant_input_has_zero_entropy(byte in any::<u8>(), len in 1usize..1024) {
        prop_assert_eq!(shannon_entropy(&vec![byte; len]), 0.0);
    }

    #[test]
    fn permutation_p_value_is_bounded_and_seeded(
        baseline in events(12),
        window in events(8),
        seed in any::<u64>(),
        permutations in 1usize..20,
    ) {
        let tester = PermutationSignificanceTester::new(backend(CompressionAlgorithm::Zlib));
        let first = tester.test(&baseline, &window, seed, permutations).unwrap();
        let second = tester.test(&baseline, &window, seed, permutations).unwrap();

        prop_assert!(first.p_value > 0.0 && first.p_value <= 1.0);
        prop_assert!(first.exceedances <= permutations);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn window_sizes_respect_bounds(
        events_per_hour in 0.0f64..1e7,
        event_size in 0usize..1_000_000,
        entropy in 0.0f64..8.0,
        diversity in 0.0f64..1.0,
    ) {
        let cfg = AdaptiveWindowConfig::default();
        let chars = StreamCharacteristics {
            avg_events_per_hour: events_per_hour,
            avg_event_size_bytes: event_size,
            avg_baseline_entropy: entropy,
            pattern_diversity: diversity,
        };
        let rec = compute_window_sizes(&chars, &cfg);

        prop_assert!((cfg.min_baseline..=cfg.max_baseline).contains(&rec.baseline_size));
        prop_assert!((cfg.min_window..=cfg.max_window).contains(&rec.window_size));
        prop_assert!(rec.window_size <= rec.baseline_size);
    }

    #[test]
    fn tuned_thresholds_stay_in_bounds(
        total in 20usize..500,
        fp_share in 0.0f64..1.0,
        confirmed_share in 0.0f64..1.0,
        avg_fp_ncd in 0.0f64..1.0,
        ncd in 0.1f64..0.8,
        p_value in 0.001f64..0.2,
    ) {
        let false_positives = (total as f64 * fp_share) as usize;
        let confirmed = ((total - false_positives) as f64 * confirmed_share) as usize;
        let stats = FeedbackStats::new(total, false_positives, confirmed).with_avg_fp_ncd(avg_fp_ncd);
        let decision = evaluate(&stats, Thresholds { ncd, p_value }, &AutoTuneConfig::default());

        prop_assert!((NCD_THRESHOLD_BOUNDS.0..=NCD_THRESHOLD_BOUNDS.1).contains(&decision.new_ncd));
        prop_assert!(
            (P_VALUE_THRESHOLD_BOUNDS.0..=P_VALUE_THRESHOLD_BOUNDS.1).contains(&decision.new_p_value)
        );
    }

    #[test]
    fn sparse_feedback_never_adjusts(total in 0usize..20, ncd in 0.1f64..0.8, p_value in 0.001f64..0.2) {
        let stats = FeedbackStats::new(total, total, 0);
        let decision = evaluate(&stats, Thresholds { ncd, p_value }, &AutoTuneConfig::default());
        prop_assert!(!decision.should_adjust);
        prop_assert_eq!(decision.new_ncd, ncd);
        prop_assert_eq!(decision.new_p_value, p_value);
    }

    #[test]
    fn welford_matches_two_pass(values in prop::collection::vec(-1e6f64..1e6, 2..200)) {
        let mut stats = NumericStats::new();
        for &v in &values {
            stats.update(v);
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);

        prop_assert!((stats.mean - mean).abs() <= 1e-6 * mean.abs().max(1.0));
        prop_assert!((stats.variance() - variance).abs() <= 1e-6 * variance.max(1.0));
    }

    #[test]
    fn tokenizer_never_grows_events(line in "[ -~]{0,300}") {
        let tokenizer = Tokenizer::new(TokenizerConfig::default()).unwrap();
        prop_assert!(tokenizer.tokenize(line.as_bytes()).len() <= line.len());
    }
}
