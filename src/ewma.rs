//! Shared exponentially weighted moving average helper.
//!
//! The Server Registry and Metadata Store both maintain a smoothed response
//! time per server and must never let the two formulas drift apart, so the
//! fold lives in exactly one place.

/// Smoothing factor used everywhere an EWMA response time is folded.
pub const ALPHA: f64 = 0.3;

/// Fold a new response-time sample into a previous EWMA value.
///
/// `previous` is `None` on the first-ever sample for a server, in which case
/// the sample itself seeds the average (no decay toward a non-existent prior
/// value).
pub fn fold(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(prev) => ALPHA * sample + (1.0 - ALPHA) * prev,
        None => sample,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_average() {
        assert_eq!(fold(None, 0.05), 0.05);
    }

    #[test]
    fn scenario_sequence_from_spec() {
        // Health transition scenario: Error, Error, Error, Online(0.05).
        // Errors don't touch the EWMA; the first Online sample seeds it.
        let ewma = fold(None, 0.05);
        assert_eq!(ewma, 0.05);
    }

    #[test]
    fn fold_matches_manual_arithmetic() {
        let e0 = fold(None, 1.0);
        let e1 = fold(Some(e0), 2.0);
        let e2 = fold(Some(e1), 3.0);
        assert_eq!(e0, 1.0);
        assert!((e1 - (0.3 * 2.0 + 0.7 * 1.0)).abs() < 1e-12);
        assert!((e2 - (0.3 * 3.0 + 0.7 * e1)).abs() < 1e-12);
    }
}
