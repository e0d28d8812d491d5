use super::GLOBAL_LABELS;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Histogram buckets to measure the distribution of durations in seconds
pub(crate) const DEFAULT_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Number of updates received from Telegram
pub(crate) const TG_UPDATES_TOTAL: &str = "tg_updates_total";

/// Number of requests rejected by the per-user rate limiter
pub(crate) const RATE_LIMIT_REJECTIONS_TOTAL: &str = "rate_limit_rejections_total";

/// Number of retries scheduled by the retry executor
pub(crate) const RETRY_ATTEMPTS_TOTAL: &str = "retry_attempts_total";

/// Number of media downloads by their outcome
pub(crate) const MEDIA_DOWNLOADS_TOTAL: &str = "media_downloads_total";

/// Duration of external program invocations
pub(crate) const PROCESS_DURATION_SECONDS: &str = "process_duration_seconds";

/// Duration of processing a single message with media links end-to-end
pub(crate) const MESSAGE_DURATION_SECONDS: &str = "message_duration_seconds";

pub fn init_metrics() {
    let mut builder = PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], 2000));

    for histogram in [PROCESS_DURATION_SECONDS, MESSAGE_DURATION_SECONDS] {
        builder = builder
            .set_buckets_for_metric(Matcher::Full(histogram.to_owned()), DEFAULT_DURATION_BUCKETS)
            .unwrap_or_else(|err| {
                panic!("BUG: histogram `{histogram}` defined empty list of buckets: {err:?}")
            });
    }

    for (key, value) in GLOBAL_LABELS {
        builder = builder.add_global_label(*key, *value);
    }

    builder
        .install()
        .expect("BUG: failed to initialize the metrics listener");

    describe();
}

fn describe() {
    metrics::describe_counter!(TG_UPDATES_TOTAL, "Number of updates received from Telegram");
    metrics::describe_counter!(
        RATE_LIMIT_REJECTIONS_TOTAL,
        "Number of requests rejected by the per-user rate limiter"
    );
    metrics::describe_counter!(
        RETRY_ATTEMPTS_TOTAL,
        "Number of retries scheduled by the retry executor"
    );
    metrics::describe_counter!(
        MEDIA_DOWNLOADS_TOTAL,
        "Number of media downloads by their outcome"
    );
    metrics::describe_histogram!(
        PROCESS_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of external program invocations"
    );
    metrics::describe_histogram!(
        MESSAGE_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of processing a single message with media links"
    );
}
