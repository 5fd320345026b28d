use crate::{operations::OperationKind, time_key::MINUTE_MS};

/// Payload-size ladder exercised by every probing cycle, smallest first.
pub(crate) const PAYLOAD_SIZES: [u64; 4] = [0, 1_000_000, 5_000_000, 25_000_000];

/// Reference origin codes used to phase-shift per-origin schedules. An
/// origin is classified by the first reference code sorting after it.
const ORIGIN_RANGES: [&str; 33] = [
    "AMS", "BCN", "BNU", "BUD", "CFC", "CMH", "CWB", "DME", "DXB", "FLN", "GRU", "HAM", "HYD",
    "ITJ", "JOI", "KIX", "LAX", "LLK", "MBA", "MEX", "MPM", "NBO", "ORD", "PBM", "PNH", "RIC",
    "SFO", "SLC", "SYD", "TLV", "ULN", "XNH", "YYZ",
];

const GROUP_COUNT: usize = 5;

/// Storage endpoint groups; one group is probed per schedule slot.
pub(crate) static ENDPOINT_GROUPS: [[&str; 5]; GROUP_COUNT] = [
    ["AMS", "ARN", "ATL", "CDG", "DEN"],
    ["DFW", "EWR", "FRA", "HKG", "IAD"],
    ["KIX", "LAX", "LHR", "MAD", "MIA"],
    ["MRS", "MXP", "NRT", "ORD", "PRG"],
    ["SEA", "SIN", "SJC", "TPE", "VIE"],
];

/// Minute zero for schedule indexing: 2022-01-01T00:00:00Z.
pub(crate) const SCHEDULE_EPOCH_MS: i64 = 1_640_995_200_000;

// sizes x {put, get} x groups
const OPTION_SPACE: i64 = (PAYLOAD_SIZES.len() * 2 * GROUP_COUNT) as i64;

/// One slot of the probing schedule: which operation to run at which
/// payload size against which endpoint group.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub(crate) struct ProbePlan {
    pub(crate) operation: OperationKind,
    pub(crate) bytes: u64,
    pub(crate) group: usize,
    pub(crate) endpoints: &'static [&'static str],
}

/// Phase offset for an origin, derived from its position relative to the
/// reference code list. Origins in different buckets probe different slots
/// at the same minute.
pub(crate) fn origin_offset(origin: &str) -> i64 {
    ORIGIN_RANGES
        .iter()
        .position(|range| origin < *range)
        .map(|index| index as i64 + 1)
        .unwrap_or(ORIGIN_RANGES.len() as i64)
}

/// Deterministically selects the probe slot for `(now_ms, origin)`. Pure:
/// the same inputs always yield the same plan, and consecutive minutes walk
/// the full size x operation x group space before repeating.
pub(crate) fn select(now_ms: i64, origin: &str) -> ProbePlan {
    let minutes = (now_ms - SCHEDULE_EPOCH_MS) / MINUTE_MS;
    let index = (minutes + origin_offset(origin)).rem_euclid(OPTION_SPACE);

    let group = (index % GROUP_COUNT as i64) as usize;
    let operation = if (index / GROUP_COUNT as i64) % 2 == 0 {
        OperationKind::Put
    } else {
        OperationKind::Get
    };
    let bytes = PAYLOAD_SIZES
        [((index / (GROUP_COUNT as i64 * 2)) % PAYLOAD_SIZES.len() as i64) as usize];

    ProbePlan {
        operation,
        bytes,
        group,
        endpoints: &ENDPOINT_GROUPS[group],
    }
}

/// Object key shared by every origin probing the same payload size. Put
/// slots refresh it; get slots read it back. Never deleted by the fleet.
pub(crate) fn fleet_object_key(bytes: u64, origin: &str) -> String {
    format!("{bytes}/{origin}")
}

#[cfg(test)]
mod tests {
    use super::{
        fleet_object_key, origin_offset, select, OperationKind, ENDPOINT_GROUPS, OPTION_SPACE,
        PAYLOAD_SIZES, SCHEDULE_EPOCH_MS,
    };
    use crate::time_key::MINUTE_MS;

    #[test]
    fn selection_is_pure() {
        let now_ms = SCHEDULE_EPOCH_MS + 987 * MINUTE_MS;

        assert_eq!(select(now_ms, "DFW"), select(now_ms, "DFW"));
    }

    #[test]
    fn origins_in_different_buckets_diverge() {
        let now_ms = SCHEDULE_EPOCH_MS + 11 * MINUTE_MS;

        assert_ne!(origin_offset("AAA"), origin_offset("DFW"));
        assert_ne!(select(now_ms, "AAA"), select(now_ms, "DFW"));
    }

    #[test]
    fn origin_past_every_range_uses_last_bucket() {
        assert_eq!(origin_offset("ZZZ"), 33);
    }

    #[test]
    fn full_option_space_is_cycled() {
        let mut seen = std::collections::BTreeSet::new();

        for minute in 0..OPTION_SPACE {
            let plan = select(SCHEDULE_EPOCH_MS + minute * MINUTE_MS, "DFW");
            seen.insert((plan.operation, plan.bytes, plan.group));
        }

        assert_eq!(seen.len(), OPTION_SPACE as usize);
    }

    #[test]
    fn cycle_offset_zero_is_smallest_put_against_group_zero() {
        // DFW sits in bucket 8, so 32 minutes past the epoch its index wraps
        // to slot zero
        assert_eq!(origin_offset("DFW"), 8);

        let plan = select(SCHEDULE_EPOCH_MS + 32 * MINUTE_MS, "DFW");

        assert_eq!(plan.operation, OperationKind::Put);
        assert_eq!(plan.bytes, PAYLOAD_SIZES[0]);
        assert_eq!(plan.group, 0);
        assert_eq!(plan.endpoints, &ENDPOINT_GROUPS[0][..]);
    }

    #[test]
    fn fleet_keys_group_by_size() {
        assert_eq!(fleet_object_key(1_000_000, "DFW"), "1000000/DFW");
    }
}
