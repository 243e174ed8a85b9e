//! Prometheus Metrics Module
//!
//! Exposes stream metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: Frames received from the provider, decode failures
//! - **Ticks**: Accepted ticks per pair, rejections per reason
//! - **Buffers**: Evictions caused by slow consumers
//! - **Connection**: State gauge, reconnects, close timeouts, subscribed pairs
//! - **Latency**: Frame processing time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;
use crate::domain::normalizer::RejectReason;
use crate::domain::tick::CurrencyPair;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder was already installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "fx_stream_messages_received_total",
        "Total frames received from the provider"
    );
    describe_counter!(
        "fx_stream_decode_errors_total",
        "Total provider frames that failed to decode"
    );

    describe_counter!(
        "fx_stream_ticks_accepted_total",
        "Total ticks accepted by the normalizer"
    );
    describe_counter!(
        "fx_stream_ticks_rejected_total",
        "Total payloads rejected by the normalizer by reason"
    );

    describe_counter!(
        "fx_stream_buffer_overflow_total",
        "Total ticks evicted from consumer buffers"
    );

    describe_gauge!(
        "fx_stream_connection_state",
        "Connection state (0=disconnected 1=connecting 2=subscribing 3=live 4=backoff)"
    );
    describe_counter!(
        "fx_stream_reconnects_total",
        "Total reconnection attempts"
    );
    describe_counter!(
        "fx_stream_close_timeouts_total",
        "Total transport sessions dropped because the close did not finish"
    );
    describe_gauge!(
        "fx_stream_subscribed_pairs",
        "Number of currency pairs in the working set"
    );

    describe_histogram!(
        "fx_stream_message_processing_seconds",
        "Time from frame receipt to fan-out"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received from the provider.
pub fn record_message_received(provider: &'static str) {
    counter!(
        "fx_stream_messages_received_total",
        "provider" => provider
    )
    .increment(1);
}

/// Record a frame the provider adapter could not decode.
pub fn record_decode_error(provider: &'static str) {
    counter!(
        "fx_stream_decode_errors_total",
        "provider" => provider
    )
    .increment(1);
}

/// Record an accepted tick.
pub fn record_tick_accepted(pair: CurrencyPair) {
    counter!(
        "fx_stream_ticks_accepted_total",
        "pair" => pair.to_string()
    )
    .increment(1);
}

/// Record a normalizer rejection.
pub fn record_tick_rejected(reason: RejectReason) {
    counter!(
        "fx_stream_ticks_rejected_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record ticks evicted from consumer buffers.
pub fn record_buffer_overflow(count: u64) {
    counter!("fx_stream_buffer_overflow_total").increment(count);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("fx_stream_connection_state").set(f64::from(state.code()));
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("fx_stream_reconnects_total").increment(1);
}

/// Record a transport session dropped after its close timed out.
pub fn record_close_timeout(provider: &'static str) {
    counter!(
        "fx_stream_close_timeouts_total",
        "provider" => provider
    )
    .increment(1);
}

/// Update the subscribed pair count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribed_pairs(count: usize) {
    gauge!("fx_stream_subscribed_pairs").set(count as f64);
}

/// Record frame processing duration.
pub fn record_processing_duration(duration: Duration) {
    histogram!("fx_stream_message_processing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
