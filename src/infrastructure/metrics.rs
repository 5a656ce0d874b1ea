//! Prometheus metrics exporter

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus recorder, serving `/metrics` on `listen`
pub fn init_metrics(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .set_buckets_for_metric(
            Matcher::Full("sipbridge_call_duration_seconds".to_string()),
            &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0],
        )?
        .install()?;

    describe_metrics();
    info!("Prometheus metrics exported on http://{}/metrics", listen);
    Ok(())
}

fn describe_metrics() {
    describe_gauge!("sipbridge_active_calls", "Calls currently being set up or bridged");
    describe_gauge!("sipbridge_registered_aors", "Addresses of record with a stored binding");
    describe_counter!("sipbridge_registrations_total", "REGISTER requests applied to the registry");
    describe_counter!("sipbridge_calls_total", "Inbound call attempts");
    describe_counter!("sipbridge_calls_completed_total", "Bridged calls that ended normally");
    describe_counter!("sipbridge_calls_failed_total", "Call attempts that failed, by reason");
    describe_histogram!("sipbridge_call_duration_seconds", "Talk time of bridged calls");
}
