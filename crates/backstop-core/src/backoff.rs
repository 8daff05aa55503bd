//! Backoff and scheduling arithmetic.
//!
//! Pure functions shared by the primary-path retry manager and the DLQ
//! worker. The primary path grows delays exponentially with jitter; the
//! worker indexes a coarse, operator-tunable schedule and can defer work to
//! an off-peak hour.

use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, Utc};
use rand::Rng;

/// Largest exponent applied to the base delay; beyond it the cap wins for
/// any realistic configuration.
const MAX_EXPONENT: u32 = 31;

/// Capped exponential delay without jitter: `min(base * 2^retry_count, max)`.
pub fn capped_exponential(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(retry_count.min(MAX_EXPONENT));
    base.saturating_mul(multiplier).min(max)
}

/// Capped exponential delay with symmetric jitter.
///
/// The capped delay is perturbed by a uniform offset within
/// `±jitter_percent%` of itself, floored at zero and rounded to the nearest
/// millisecond. The result never exceeds `max * (1 + jitter_percent / 100)`.
pub fn exponential_backoff(
    retry_count: u32,
    base: Duration,
    max: Duration,
    jitter_percent: f64,
) -> Duration {
    let capped = capped_exponential(retry_count, base, max);
    let capped_ms = capped.as_secs_f64() * 1000.0;
    let range = capped_ms * jitter_percent.clamp(0.0, 100.0) / 100.0;

    let offset = if range > 0.0 { rand::rng().random_range(-range..=range) } else { 0.0 };

    let jittered = (capped_ms + offset).max(0.0).round();
    Duration::from_millis(jittered as u64)
}

/// Delay for the `index`-th DLQ retry, clamped to the last schedule entry.
///
/// An empty schedule means no delay.
pub fn scheduled_delay(index: u32, schedule: &[Duration]) -> Duration {
    let Some(last) = schedule.len().checked_sub(1) else {
        return Duration::ZERO;
    };
    let position = usize::try_from(index).unwrap_or(usize::MAX).min(last);
    schedule[position]
}

/// Next occurrence of `hour:00:00` UTC strictly after `now`.
///
/// Hours above 23 are clamped to 23.
pub fn next_off_peak(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}

/// Human-readable duration with the two most significant units:
/// `"2d 3h"`, `"4h 12m"`, `"5m 30s"`, `"42s"`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, hours, minutes, seconds) =
        (total / 86_400, (total / 3_600) % 24, (total / 60) % 60, total % 60);

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Converts a std duration into a chrono one, saturating on overflow.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn minutes(list: &[u64]) -> Vec<Duration> {
        list.iter().map(|m| Duration::from_secs(m * 60)).collect()
    }

    #[test]
    fn exponential_without_jitter_doubles_until_cap() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(30_000);

        let delays: Vec<u128> =
            (0..7).map(|n| exponential_backoff(n, base, max, 0.0).as_millis()).collect();

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn huge_retry_counts_do_not_overflow() {
        let delay = capped_exponential(u32::MAX, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn schedule_clamps_to_last_entry() {
        let schedule = minutes(&[1, 5, 15, 30, 60]);

        assert_eq!(scheduled_delay(0, &schedule), Duration::from_secs(60));
        assert_eq!(scheduled_delay(2, &schedule), Duration::from_secs(15 * 60));
        assert_eq!(scheduled_delay(9, &schedule), Duration::from_secs(60 * 60));
        assert_eq!(scheduled_delay(3, &[]), Duration::ZERO);
    }

    #[test]
    fn off_peak_later_today_when_hour_ahead() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 1, 15, 0).unwrap();
        assert_eq!(next_off_peak(now, 2), Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap());
    }

    #[test]
    fn off_peak_tomorrow_when_hour_passed() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap();
        assert_eq!(next_off_peak(now, 2), Utc.with_ymd_and_hms(2024, 3, 11, 2, 0, 0).unwrap());

        let evening = Utc.with_ymd_and_hms(2024, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(next_off_peak(evening, 2), Utc.with_ymd_and_hms(2025, 1, 1, 2, 0, 0).unwrap());
    }

    #[test]
    fn durations_format_with_two_units() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(330)), "5m 30s");
        assert_eq!(format_duration(Duration::from_secs(4 * 3600 + 12 * 60)), "4h 12m");
        assert_eq!(format_duration(Duration::from_secs(2 * 86_400 + 3 * 3600 + 5)), "2d 3h");
    }

    proptest! {
        #[test]
        fn jittered_backoff_stays_within_bounds(
            retry_count in 0u32..64,
            base_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            jitter in 0.0f64..=100.0,
        ) {
            let max = Duration::from_millis(max_ms);
            let delay = exponential_backoff(retry_count, Duration::from_millis(base_ms), max, jitter);
            let ceiling = (max_ms as f64 * (1.0 + jitter / 100.0)).ceil() as u128;

            prop_assert!(delay.as_millis() <= ceiling);
        }

        #[test]
        fn unjittered_backoff_is_monotonic(
            retry_count in 0u32..40,
            base_ms in 1u64..5_000,
            max_ms in 1u64..600_000,
        ) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(max_ms);
            prop_assert!(
                capped_exponential(retry_count, base, max)
                    <= capped_exponential(retry_count + 1, base, max)
            );
        }
    }
}
