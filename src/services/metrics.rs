//! Prometheus metrics, registered in the default registry served at /metrics

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// Finished refresh cycles by outcome (succeeded, partial, failed)
    pub static ref REFRESHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dtv_refreshes_total",
        "Refresh cycles by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref REFRESH_DURATION: Histogram = register_histogram!(
        "dtv_refresh_duration_seconds",
        "Wall time of a refresh cycle",
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    )
    .unwrap();

    pub static ref PUBLISHED_CHANNELS: IntGauge = register_int_gauge!(
        "dtv_published_channels",
        "Channels in the last published lineup"
    )
    .unwrap();

    pub static ref PUBLISHED_PROGRAMS: IntGauge = register_int_gauge!(
        "dtv_published_programs",
        "Programmes in the last published guide"
    )
    .unwrap();

    /// Browser logins by result (success, failure)
    pub static ref LOGINS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dtv_logins_total",
        "Browser login attempts by result",
        &["result"]
    )
    .unwrap();

    /// Provider API requests by endpoint and result
    pub static ref PROVIDER_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dtv_provider_requests_total",
        "Provider API requests by endpoint and result",
        &["endpoint", "result"]
    )
    .unwrap();
}
