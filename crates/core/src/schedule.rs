//! Scheduling math: backoff policies, aligned delays, and slot key formatting.
//!
//! Everything here is pure. Time is always passed in, never read from the
//! clock, so the functions behave identically in tests and in production.
//!
//! ## Units
//!
//! All delays are whole seconds (`u64`). Backends translate them into
//! timers or absolute "not before" timestamps.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike};

/// Longest delay `compute_next_daily_run_delay_seconds` ever returns.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Exponential backoff for an attempt counter (1-indexed).
///
/// Returns `min(cap, base * 2^(attempt - 1))`. `attempt` is clamped to at
/// least 1, and the multiplication saturates instead of overflowing, so the
/// result is non-decreasing in `attempt` and never exceeds `cap`.
pub fn compute_exponential_backoff(attempt: u32, base: u64, cap: u64) -> u64 {
    let exponent = attempt.max(1) - 1;
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Seconds until the next `target_hour:00:00` in `now`'s time zone.
///
/// If `now` is already at or past the target hour, the run rolls over to the
/// next day. The result is kept within `[1, 86400]`: a zero delay would spin
/// the caller, and DST transitions must not push the wait past one day.
pub fn compute_next_daily_run_delay_seconds<Tz: TimeZone>(target_hour: u32, now: &DateTime<Tz>) -> u64 {
    let hour = target_hour.min(23);
    let mut date = now.date_naive();
    if now.hour() >= hour {
        date = date.succ_opt().unwrap_or(date);
    }

    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let local = date.and_time(time);
    let tz = now.timezone();

    // A target that falls into a DST gap resolves to the first valid instant
    // after it.
    let target = tz
        .from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest());

    let seconds = match target {
        Some(target) => (target.timestamp() - now.timestamp()).max(1) as u64,
        None => SECONDS_PER_DAY,
    };

    seconds.clamp(1, SECONDS_PER_DAY)
}

/// Seconds (rounded up) until the next wall-clock minute boundary, floored at
/// `min_seconds`.
pub fn compute_next_minute_boundary_delay_seconds<Tz: TimeZone>(now: &DateTime<Tz>, min_seconds: u64) -> u64 {
    let millis_into_minute =
        u64::from(now.second()) * 1_000 + u64::from(now.timestamp_subsec_millis().min(999));
    let remaining_ms = 60_000 - millis_into_minute;
    remaining_ms.div_ceil(1_000).max(min_seconds)
}

/// Backoff relative to the previous delay instead of an attempt counter.
///
/// Below `base` the delay snaps up to `base`; otherwise it doubles, capped at
/// `cap`. Once at the cap it stays there.
pub fn compute_backoff_from_delay(current_delay_seconds: u64, base: u64, cap: u64) -> u64 {
    if current_delay_seconds < base {
        return base.min(cap);
    }
    current_delay_seconds.saturating_mul(2).min(cap)
}

/// Backoff that holds steady while the delay is still near the base cadence.
///
/// When `current_delay_seconds <= base * near_multiplier` the delay does not
/// grow (`max(base, current)`); beyond that window it doubles and caps like
/// [`compute_backoff_from_delay`]. A slightly late run therefore does not
/// tip a poller into long backoff.
pub fn compute_backoff_with_near_window(
    current_delay_seconds: u64,
    base: u64,
    cap: u64,
    near_multiplier: u64,
) -> u64 {
    let near_window = base.saturating_mul(near_multiplier);
    if current_delay_seconds <= near_window {
        return base.max(current_delay_seconds).min(cap);
    }
    current_delay_seconds.saturating_mul(2).min(cap)
}

/// Interval with random spread: `base + floor(sample * jitter)`.
///
/// `sample` is expected in `[0, 1)`; values outside are clamped. The random
/// source stays with the caller.
pub fn compute_jittered_interval(base: u64, jitter: u64, sample: f64) -> u64 {
    let sample = if sample.is_finite() { sample.clamp(0.0, 1.0) } else { 0.0 };
    let spread = ((jitter as f64) * sample).floor() as u64;
    base.saturating_add(spread.min(jitter))
}

/// `YYYY-MM-DD` in the value's own time zone.
pub fn format_date_key<Tz: TimeZone>(d: &DateTime<Tz>) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month(), d.day())
}

/// `YYYYMMDD-HHMM` in the value's own time zone.
pub fn format_minute_key<Tz: TimeZone>(d: &DateTime<Tz>) -> String {
    format!(
        "{:04}{:02}{:02}-{:02}{:02}",
        d.year(),
        d.month(),
        d.day(),
        d.hour(),
        d.minute()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn exponential_backoff_matches_known_values() {
        assert_eq!(compute_exponential_backoff(1, 60, 900), 60);
        assert_eq!(compute_exponential_backoff(2, 60, 900), 120);
        assert_eq!(compute_exponential_backoff(10, 60, 180), 180);
    }

    #[test]
    fn exponential_backoff_clamps_attempt_zero() {
        assert_eq!(compute_exponential_backoff(0, 60, 900), 60);
    }

    #[test]
    fn exponential_backoff_saturates_for_huge_attempts() {
        assert_eq!(compute_exponential_backoff(200, 60, 3_600), 3_600);
        assert_eq!(compute_exponential_backoff(u32::MAX, u64::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn daily_delay_before_target_hour_is_same_day() {
        let now = utc(2024, 3, 10, 7, 30, 0);
        assert_eq!(compute_next_daily_run_delay_seconds(9, &now), 90 * 60);
    }

    #[test]
    fn daily_delay_at_or_after_target_hour_rolls_to_next_day() {
        let at = utc(2024, 3, 10, 9, 0, 0);
        assert_eq!(compute_next_daily_run_delay_seconds(9, &at), SECONDS_PER_DAY);

        let after = utc(2024, 3, 10, 23, 59, 59);
        assert_eq!(compute_next_daily_run_delay_seconds(9, &after), 9 * 3_600 + 1);
    }

    #[test]
    fn daily_delay_uses_the_values_own_offset() {
        let plus_two = FixedOffset::east_opt(2 * 3_600).unwrap();
        // 08:00 local is 06:00 UTC; the local target hour is what counts.
        let now = plus_two.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        assert_eq!(compute_next_daily_run_delay_seconds(9, &now), 3_600);
    }

    #[test]
    fn minute_boundary_rounds_up_and_respects_floor() {
        let now = utc(2024, 1, 1, 12, 0, 45);
        assert_eq!(compute_next_minute_boundary_delay_seconds(&now, 1), 15);
        assert_eq!(compute_next_minute_boundary_delay_seconds(&now, 30), 30);

        let on_boundary = utc(2024, 1, 1, 12, 1, 0);
        assert_eq!(compute_next_minute_boundary_delay_seconds(&on_boundary, 1), 60);

        let mid_second = on_boundary + Duration::milliseconds(59_500);
        assert_eq!(compute_next_minute_boundary_delay_seconds(&mid_second, 0), 1);
    }

    #[test]
    fn backoff_from_delay_matches_known_values() {
        assert_eq!(compute_backoff_from_delay(0, 60, 600), 60);
        assert_eq!(compute_backoff_from_delay(60, 60, 600), 120);
        assert_eq!(compute_backoff_from_delay(400, 60, 600), 600);
        assert_eq!(compute_backoff_from_delay(600, 60, 600), 600);
    }

    #[test]
    fn near_window_holds_then_doubles() {
        assert_eq!(compute_backoff_with_near_window(30, 15, 120, 2), 30);
        assert_eq!(compute_backoff_with_near_window(50, 10, 60, 2), 60);
        assert_eq!(compute_backoff_with_near_window(5, 15, 120, 2), 15);
        assert_eq!(compute_backoff_with_near_window(31, 15, 120, 2), 62);
    }

    #[test]
    fn jittered_interval_stays_in_range() {
        assert_eq!(compute_jittered_interval(60, 30, 0.0), 60);
        assert_eq!(compute_jittered_interval(60, 30, 0.5), 75);
        assert_eq!(compute_jittered_interval(60, 30, 0.999), 89);
        assert_eq!(compute_jittered_interval(60, 30, 7.0), 90);
        assert_eq!(compute_jittered_interval(60, 30, f64::NAN), 60);
    }

    #[test]
    fn keys_are_zero_padded() {
        let d = utc(2024, 2, 3, 4, 5, 6);
        assert_eq!(format_date_key(&d), "2024-02-03");
        assert_eq!(format_minute_key(&d), "20240203-0405");
    }

    #[test]
    fn keys_follow_the_values_offset() {
        let minus_five = FixedOffset::west_opt(5 * 3_600).unwrap();
        let d = utc(2024, 1, 1, 2, 30, 0).with_timezone(&minus_five);
        assert_eq!(format_date_key(&d), "2023-12-31");
        assert_eq!(format_minute_key(&d), "20231231-2130");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: exponential backoff never exceeds its cap and never
        /// shrinks as the attempt counter grows.
        #[test]
        fn exponential_backoff_is_capped_and_monotonic(
            attempt in 1u32..200,
            base in 0u64..100_000,
            cap in 0u64..10_000_000,
        ) {
            let current = compute_exponential_backoff(attempt, base, cap);
            let next = compute_exponential_backoff(attempt + 1, base, cap);
            prop_assert!(current <= cap);
            prop_assert!(current <= next);
        }

        /// Property: the daily delay is always within (0, 86400].
        #[test]
        fn daily_delay_is_within_one_day(
            secs in 0i64..4_102_444_800,
            hour in 0u32..24,
            offset_minutes in -720i32..=840,
        ) {
            let tz = FixedOffset::east_opt(offset_minutes * 60).unwrap();
            let now = Utc.timestamp_opt(secs, 0).unwrap().with_timezone(&tz);
            let delay = compute_next_daily_run_delay_seconds(hour, &now);
            prop_assert!(delay > 0 && delay <= SECONDS_PER_DAY);
        }

        /// Property: once the cap is reached, delay-relative backoff stays there.
        #[test]
        fn backoff_from_delay_never_exceeds_cap(
            current in 0u64..1_000_000,
            base in 1u64..1_000,
            extra in 0u64..100_000,
        ) {
            let cap = base + extra;
            let next = compute_backoff_from_delay(current, base, cap);
            prop_assert!(next <= cap);
            prop_assert_eq!(compute_backoff_from_delay(cap, base, cap), cap);
        }
    }
}
