//! Time-weighted average and max arithmetic of value segments.

use chrono::Duration;
use tracing::warn;

fn seconds(period: Duration) -> f64 {
    period.num_milliseconds() as f64 / 1000.0
}

/// Whether two periods together last less than one whole second.
fn sub_second(period1: Duration, period2: Duration) -> bool {
    (seconds(period1) + seconds(period2)).trunc() == 0.0
}

/// Average of two averages weighted by their durations.
///
/// Windows shorter than a second in total fall back to the arithmetic mean.
pub fn combine_average(average1: f64, period1: Duration, average2: f64, period2: Duration) -> f64 {
    if sub_second(period1, period2) {
        warn!(average1, average2, "sub-second periods, arithmetic mean used");
        return (average1 + average2) / 2.0;
    }
    let (s1, s2) = (seconds(period1), seconds(period2));
    (average1 * s1 + average2 * s2) / (s1 + s2)
}

/// Standard deviation of the union of two windows whose combined average is
/// `average`.
pub fn combine_deviation(
    average1: f64,
    deviation1: f64,
    period1: Duration,
    average2: f64,
    deviation2: f64,
    period2: Duration,
    average: f64,
) -> f64 {
    let x1 = deviation1.powi(2) + average1.powi(2);
    let x2 = deviation2.powi(2) + average2.powi(2);
    let variance = if sub_second(period1, period2) {
        warn!("sub-second periods, equal weights used for the deviation");
        (x1 + x2) / 2.0 - average.powi(2)
    } else {
        let (s1, s2) = (seconds(period1), seconds(period2));
        (x1 * s1 + x2 * s2) / (s1 + s2) - average.powi(2)
    };
    // Rounding keeps values like -1e-12 out of the square root.
    let variance = (variance * 1e5).round() / 1e5;
    variance.max(0.0).sqrt()
}

/// Larger of two maxima.
pub fn combine_max(max1: f64, max2: f64) -> f64 {
    max1.max(max2)
}

/// Max-minus-min deviation of two windows described by their max and deviation.
pub fn combine_max_deviation(max1: f64, deviation1: f64, max2: f64, deviation2: f64) -> f64 {
    let min = (max1 - deviation1).min(max2 - deviation2);
    combine_max(max1, max2) - min
}
