pub(super) fn init_metrics() {
    describe_sinks();
    describe_recorder();
    describe_aggregation();
}

fn describe_sinks() {
    metrics::describe_histogram!(
        LATENCY_POINTS,
        "Measured latency of one storage operation against one endpoint, in milliseconds"
    );
    metrics::describe_counter!(
        ERROR_EVENTS,
        "Failures surfaced by probes, recording and aggregation, tagged by subsystem"
    );
}

pub(crate) const LATENCY_POINTS: &str = "storewatch.latency";
pub(crate) const ERROR_EVENTS: &str = "storewatch.errors";

fn describe_recorder() {
    metrics::describe_counter!(
        SAMPLES_RECORDED,
        "How many minute-level samples have been written to the time series"
    );
    metrics::describe_counter!(
        SAMPLES_SKIPPED,
        "How many samples were dropped because their minute bucket was already recorded"
    );
}

pub(crate) const SAMPLES_RECORDED: &str = "storewatch.samples.recorded";
pub(crate) const SAMPLES_SKIPPED: &str = "storewatch.samples.skipped";

fn describe_aggregation() {
    metrics::describe_counter!(HOURLY_RUNS, "How many hourly aggregation runs have completed");
    metrics::describe_histogram!(
        HOURLY_DURATION,
        "Timings for hourly aggregation runs"
    );
    metrics::describe_counter!(DAILY_RUNS, "How many daily aggregation runs have completed");
    metrics::describe_histogram!(DAILY_DURATION, "Timings for daily aggregation runs");
    metrics::describe_counter!(
        AGGREGATION_RETRIES,
        "How many times the daily step has been rescheduled after a failure"
    );
}

pub(crate) const HOURLY_RUNS: &str = "storewatch.aggregation.hourly";
pub(crate) const HOURLY_DURATION: &str = "storewatch.aggregation.hourly.duration";
pub(crate) const DAILY_RUNS: &str = "storewatch.aggregation.daily";
pub(crate) const DAILY_DURATION: &str = "storewatch.aggregation.daily.duration";
pub(crate) const AGGREGATION_RETRIES: &str = "storewatch.aggregation.retries";
