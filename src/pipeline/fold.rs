use std::collections::BTreeMap;

use crate::{
    operations::OperationKind,
    repo::{AggregatedView, Sample},
    time_key,
};

pub(crate) fn pair_key(origin: &str, endpoint: &str) -> String {
    format!("{origin}->{endpoint}")
}

/// Folds minute samples into one view per hour, keyed by reverse hour key.
/// Rerunning over the same samples yields the same documents.
pub(crate) fn fold_hours(samples: &[Sample]) -> BTreeMap<String, AggregatedView> {
    let mut hours = BTreeMap::new();

    for sample in samples {
        let Some(time_ms) = time_key::minute_key_to_ms(&sample.minute_key) else {
            continue;
        };

        let view = hours
            .entry(time_key::hour_key(time_ms))
            .or_insert_with(AggregatedView::default);

        push_sample(view, sample);
    }

    hours
}

fn push_sample(view: &mut AggregatedView, sample: &Sample) {
    for (endpoint, latency) in &sample.latencies {
        let slot = view
            .0
            .entry(pair_key(&sample.origin, endpoint))
            .or_default()
            .entry(sample.bytes)
            .or_default();

        match sample.operation {
            OperationKind::Get => slot.get.push(*latency),
            OperationKind::Put => slot.put.push(*latency),
            // deletes only happen in the anchor cycle and are not rolled up
            OperationKind::Delete => {}
        }
    }
}

/// Concatenates views in the order given; the daily roll-up passes hours
/// chronologically so latency lists stay in arrival order.
pub(crate) fn merge_views(views: impl IntoIterator<Item = AggregatedView>) -> AggregatedView {
    let mut merged = AggregatedView::default();

    for view in views {
        for (pair, sizes) in view.0 {
            for (bytes, latencies) in sizes {
                let slot = merged
                    .0
                    .entry(pair.clone())
                    .or_default()
                    .entry(bytes)
                    .or_default();

                slot.get.extend(latencies.get);
                slot.put.extend(latencies.put);
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::{fold_hours, merge_views, pair_key};
    use crate::{
        operations::OperationKind,
        repo::{AggregatedView, OperationLatencies, Sample},
        time_key,
    };
    use std::collections::BTreeMap;

    fn sample(time_ms: i64, operation: OperationKind, latency: u64) -> Sample {
        Sample {
            minute_key: time_key::minute_key(time_ms),
            origin: "DFW".to_string(),
            operation,
            bytes: 1_000_000,
            latencies: BTreeMap::from([("AMS".to_string(), latency)]),
        }
    }

    #[test]
    fn folding_is_idempotent() {
        let base = 19_500 * time_key::DAY_MS;
        let samples = vec![
            sample(base, OperationKind::Get, 12),
            sample(base + time_key::MINUTE_MS, OperationKind::Put, 34),
            sample(base + time_key::HOUR_MS, OperationKind::Get, 56),
        ];

        let first = fold_hours(&samples);
        let second = fold_hours(&samples);

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn samples_group_by_embedded_hour() {
        let base = 19_500 * time_key::DAY_MS;
        let samples = vec![
            sample(base, OperationKind::Get, 10),
            sample(base + 30 * time_key::MINUTE_MS, OperationKind::Get, 20),
            sample(base + time_key::HOUR_MS, OperationKind::Get, 30),
        ];

        let hours = fold_hours(&samples);

        let first_hour = &hours[&time_key::hour_key(base)];
        assert_eq!(
            first_hour.0[&pair_key("DFW", "AMS")][&1_000_000].get,
            vec![10, 20]
        );

        let second_hour = &hours[&time_key::hour_key(base + time_key::HOUR_MS)];
        assert_eq!(
            second_hour.0[&pair_key("DFW", "AMS")][&1_000_000].get,
            vec![30]
        );
    }

    #[test]
    fn merging_a_day_of_hours_concatenates_in_order() {
        let views = (0..24u64).map(|k| {
            let mut view = AggregatedView::default();
            view.0
                .entry(pair_key("A", "B"))
                .or_default()
                .insert(
                    1_000_000,
                    OperationLatencies {
                        get: vec![k],
                        put: Vec::new(),
                    },
                );
            view
        });

        let merged = merge_views(views);
        let latencies = &merged.0[&pair_key("A", "B")][&1_000_000];

        assert_eq!(latencies.get, (0..24u64).collect::<Vec<_>>());
        assert!(latencies.put.is_empty());
    }

    #[test]
    fn merging_nothing_is_empty() {
        assert_eq!(
            merge_views(std::iter::empty::<AggregatedView>()),
            AggregatedView::default()
        );
    }
}
