use time::OffsetDateTime;

// Keys are `REVERSE_KEY_BASE - floor(epoch_ms / unit)` rendered as decimal
// strings. Every reachable value renders with the same digit count, so
// ascending lexicographic order over keys is descending chronological order
// and a plain forward scan yields newest entries first.
const REVERSE_KEY_BASE: i64 = 9_007_199_254_740_991;

pub(crate) const MINUTE_MS: i64 = 60_000;
pub(crate) const HOUR_MS: i64 = 60 * MINUTE_MS;
pub(crate) const DAY_MS: i64 = 24 * HOUR_MS;

pub(crate) fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn minute_key(time_ms: i64) -> String {
    (REVERSE_KEY_BASE - time_ms / MINUTE_MS).to_string()
}

pub(crate) fn hour_key(time_ms: i64) -> String {
    (REVERSE_KEY_BASE - time_ms / HOUR_MS).to_string()
}

pub(crate) fn day_key(time_ms: i64) -> String {
    (REVERSE_KEY_BASE - time_ms / DAY_MS).to_string()
}

pub(crate) fn minute_key_to_ms(key: &str) -> Option<i64> {
    let counter: i64 = key.parse().ok()?;
    Some((REVERSE_KEY_BASE - counter) * MINUTE_MS)
}

pub(crate) fn hour_floor(time_ms: i64) -> i64 {
    time_ms / HOUR_MS * HOUR_MS
}

/// End of the UTC day containing `time_ms`, exclusive.
pub(crate) fn day_end_boundary(time_ms: i64) -> i64 {
    (time_ms / DAY_MS + 1) * DAY_MS
}

#[cfg(test)]
mod tests {
    use super::{
        day_end_boundary, hour_floor, hour_key, minute_key, minute_key_to_ms, DAY_MS, HOUR_MS,
        MINUTE_MS,
    };

    #[test]
    fn minute_key_round_trip() {
        for time_ms in [0, 59_999, 60_000, 1_654_041_600_000, 9_999_999_999_999] {
            let recovered = minute_key_to_ms(&minute_key(time_ms)).unwrap();
            assert_eq!(recovered, time_ms / MINUTE_MS * MINUTE_MS);
        }
    }

    #[test]
    fn minutes_in_the_same_hour_share_an_hour_key() {
        let time_ms = 1_654_041_600_000 + 45 * MINUTE_MS;

        assert_eq!(hour_key(time_ms), hour_key(hour_floor(time_ms)));
        assert_ne!(hour_key(time_ms), hour_key(time_ms + HOUR_MS));
    }

    #[test]
    fn newer_minutes_sort_first() {
        let older = minute_key(1_654_041_600_000);
        let newer = minute_key(1_654_041_600_000 + MINUTE_MS);

        assert_eq!(older.len(), newer.len());
        assert!(newer < older);
    }

    #[test]
    fn day_boundary_is_exclusive_end() {
        let midnight = 19_500 * DAY_MS;

        assert_eq!(day_end_boundary(midnight), midnight + DAY_MS);
        assert_eq!(day_end_boundary(midnight + DAY_MS - 1), midnight + DAY_MS);
        assert_eq!(day_end_boundary(midnight + DAY_MS), midnight + 2 * DAY_MS);
    }

    #[test]
    fn hour_keys_distinct_within_day() {
        let midnight = 19_500 * DAY_MS;
        let keys: std::collections::BTreeSet<_> =
            (0..24).map(|i| hour_key(midnight + i * HOUR_MS)).collect();

        assert_eq!(keys.len(), 24);
    }

    #[test]
    fn non_numeric_key_is_rejected() {
        assert!(minute_key_to_ms("not-a-key").is_none());
    }
}
