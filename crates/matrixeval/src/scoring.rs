//! Score combination for evaluated jobs: quality, bitrate-reasonableness and
//! encode-speed sub-scores blended into one composite on a 0..1 scale.

/// Sub-score weights; always normalized to sum to 1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub quality: f64,
    pub speed: f64,
    pub bitrate: f64,
}

impl Weights {
    /// Fixed weighting used for matrix evaluation tasks
    pub const MATRIX: Weights = Weights { quality: 0.5, speed: 0.25, bitrate: 0.25 };

    /// Normalize arbitrary weights, falling back to the 0.6/0.2/0.2 default
    /// when the inputs do not form a positive sum
    pub fn normalized(quality: f64, speed: f64, bitrate: f64) -> Weights {
        let sum = quality + speed + bitrate;
        if !(sum > 0.0) {
            return Weights { quality: 0.6, speed: 0.2, bitrate: 0.2 };
        }
        Weights {
            quality: quality / sum,
            speed: speed / sum,
            bitrate: bitrate / sum,
        }
    }
}

fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Blend VMAF and PSNR into one 0..1 quality score.
///
/// VMAF maps from its 0..100 scale; PSNR maps 20..50 dB onto 0..1. With both
/// present the blend is 0.7·vmaf + 0.3·psnr; with one present that metric
/// stands alone; with neither the score is 0.
pub fn quality_score(vmaf: Option<f64>, psnr: Option<f64>) -> f64 {
    let vmaf_norm = vmaf.map(|v| clamp01(v / 100.0));
    let psnr_norm = psnr.map(|p| clamp01((p - 20.0) / 30.0));
    match (vmaf_norm, psnr_norm) {
        (Some(v), Some(p)) => 0.7 * v + 0.3 * p,
        (Some(v), None) => v,
        (None, Some(p)) => p,
        (None, None) => 0.0,
    }
}

/// Three-segment bitrate reasonableness score for R = actual/base:
/// R ≤ 0.25 scores 1.0; 0.25 < R ≤ 1.5 falls linearly to 0.6; beyond the
/// pivot an exponential penalty decays from 0.6.
pub fn bitrate_score(base_bps: f64, actual_bps: f64) -> f64 {
    if !(base_bps > 0.0) || !(actual_bps > 0.0) {
        return 0.0;
    }
    let r = actual_bps / base_bps;

    let pivot_r = 1.5;
    let pivot_score = 0.6;
    let alpha = 3.0;
    let beta = 2.0;

    if r <= 0.25 {
        1.0
    } else if r <= pivot_r {
        let k = -0.4 / 1.25;
        let score = 1.0 + (r - 0.25) * k;
        (score * 10000.0).round() / 10000.0
    } else {
        let score = pivot_score * (-alpha * (r - pivot_r).powf(beta)).exp();
        (score * 10000.0).round() / 10000.0
    }
}

/// Encode speed score from the real-time factor duration/export_time,
/// normalized against a target RTF and clamped to 0..1
pub fn speed_score(duration_secs: f64, export_secs: f64, target_rtf: f64) -> f64 {
    if !(duration_secs > 0.0) || !(export_secs > 0.0) || !(target_rtf > 0.0) {
        return 0.0;
    }
    let rtf = duration_secs / export_secs;
    clamp01(rtf / target_rtf)
}

/// Weighted composite of the three sub-scores, rounded to 4 decimal places
pub fn composite_score(weights: Weights, quality: f64, speed: f64, bitrate: f64) -> f64 {
    let score = weights.quality * quality + weights.speed * speed + weights.bitrate * bitrate;
    (score * 10000.0).round() / 10000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn quality_blends_or_falls_back() {
        assert!((quality_score(Some(95.0), Some(50.0)) - (0.7 * 0.95 + 0.3 * 1.0)).abs() < 1e-9);
        assert!((quality_score(Some(80.0), None) - 0.8).abs() < 1e-9);
        assert!((quality_score(None, Some(35.0)) - 0.5).abs() < 1e-9);
        assert_eq!(quality_score(None, None), 0.0);
    }

    #[test]
    fn bitrate_score_segments() {
        assert_eq!(bitrate_score(8_000_000.0, 1_000_000.0), 1.0);
        // At the pivot the linear segment lands on 0.6
        assert!((bitrate_score(1_000_000.0, 1_500_000.0) - 0.6).abs() < 1e-9);
        // Past the pivot the penalty decays below 0.6
        assert!(bitrate_score(1_000_000.0, 2_000_000.0) < 0.6);
        assert_eq!(bitrate_score(0.0, 1_000_000.0), 0.0);
        assert_eq!(bitrate_score(1_000_000.0, 0.0), 0.0);
    }

    #[test]
    fn speed_score_is_rtf_against_target() {
        // 30s of video exported in 15s is 2x real time
        assert_eq!(speed_score(30.0, 15.0, 1.0), 1.0);
        assert_eq!(speed_score(30.0, 60.0, 1.0), 0.5);
        assert_eq!(speed_score(0.0, 10.0, 1.0), 0.0);
    }

    #[test]
    fn matrix_weights_sum_to_one() {
        let w = Weights::MATRIX;
        assert!((w.quality + w.speed + w.bitrate - 1.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn normalized_weights_sum_to_one(q in 0.0f64..10.0, s in 0.0f64..10.0, b in 0.0f64..10.0) {
            let w = Weights::normalized(q, s, b);
            prop_assert!((w.quality + w.speed + w.bitrate - 1.0).abs() < 1e-9);
        }

        #[test]
        fn sub_scores_stay_in_unit_range(
            vmaf in proptest::option::of(-10.0f64..150.0),
            psnr in proptest::option::of(-10.0f64..90.0),
            base in 1.0f64..50_000_000.0,
            actual in 1.0f64..50_000_000.0,
            duration in 0.1f64..7200.0,
            export in 0.1f64..7200.0,
        ) {
            let q = quality_score(vmaf, psnr);
            let b = bitrate_score(base, actual);
            let s = speed_score(duration, export, 1.0);
            prop_assert!((0.0..=1.0).contains(&q));
            prop_assert!((0.0..=1.0).contains(&b));
            prop_assert!((0.0..=1.0).contains(&s));
            let c = composite_score(Weights::MATRIX, q, s, b);
            prop_assert!((0.0..=1.0).contains(&c));
        }
    }
}
