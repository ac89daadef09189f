//! ---
//! rq_section: "02-messaging-data-model"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Prometheus handles and activity logging for queue traffic."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use tracing::debug;

use crate::envelope::Envelope;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope appended to a queue key.
    Outbound,
    /// Envelope popped from a queue key.
    Inbound,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, channel: &str, envelope: &Envelope) {
    debug!(
        channel,
        trace_id = %envelope.trace_id,
        payload_bytes = envelope.payload.len(),
        direction = ?direction,
        "messaging activity"
    );
}

/// Prometheus metric handles for queue activity.
#[derive(Debug, Clone)]
pub struct MessagingMetrics {
    sent: IntCounter,
    consumed: IntCounter,
    malformed: IntCounter,
    handler_failures: IntCounter,
    rpc_timeouts: IntCounter,
    rpc_latency: Histogram,
    active_workers: IntGauge,
}

impl MessagingMetrics {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounter::with_opts(Opts::new(
            "rq_messages_sent_total",
            "Envelopes appended to queue keys",
        ))?;
        let consumed = IntCounter::with_opts(Opts::new(
            "rq_messages_consumed_total",
            "Envelopes handed to listener handlers",
        ))?;
        let malformed = IntCounter::with_opts(Opts::new(
            "rq_messages_malformed_total",
            "Queue items that failed to decode",
        ))?;
        let handler_failures = IntCounter::with_opts(Opts::new(
            "rq_handler_failures_total",
            "Listener handler invocations that returned an error or panicked",
        ))?;
        let rpc_timeouts = IntCounter::with_opts(Opts::new(
            "rq_rpc_timeouts_total",
            "Request/response calls that expired without an answer",
        ))?;
        let rpc_latency = Histogram::with_opts(HistogramOpts::new(
            "rq_rpc_latency_seconds",
            "Observed latency between request append and response delivery",
        ))?;
        let active_workers = IntGauge::with_opts(Opts::new(
            "rq_active_workers",
            "Pop-loops currently running across all listeners",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(consumed.clone()))?;
        registry.register(Box::new(malformed.clone()))?;
        registry.register(Box::new(handler_failures.clone()))?;
        registry.register(Box::new(rpc_timeouts.clone()))?;
        registry.register(Box::new(rpc_latency.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;

        Ok(Self {
            sent,
            consumed,
            malformed,
            handler_failures,
            rpc_timeouts,
            rpc_latency,
            active_workers,
        })
    }

    /// Record an appended envelope.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record an envelope handed to a handler.
    pub fn observe_consumed(&self) {
        self.consumed.inc();
    }

    /// Record an item that failed to decode.
    pub fn observe_malformed(&self) {
        self.malformed.inc();
    }

    /// Record a failed handler invocation.
    pub fn observe_handler_failure(&self) {
        self.handler_failures.inc();
    }

    /// Record an expired request/response call.
    pub fn observe_rpc_timeout(&self) {
        self.rpc_timeouts.inc();
    }

    /// Record request/response latency.
    pub fn observe_rpc_latency(&self, duration: Duration) {
        self.rpc_latency.observe(duration.as_secs_f64());
    }

    /// Adjust the running pop-loop gauge.
    pub fn add_active_workers(&self, delta: i64) {
        self.active_workers.add(delta);
    }

    /// Current counter values, mainly for tests and diagnostics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent: self.sent.get(),
            consumed: self.consumed.get(),
            malformed: self.malformed.get(),
            handler_failures: self.handler_failures.get(),
            rpc_timeouts: self.rpc_timeouts.get(),
            active_workers: self.active_workers.get(),
        }
    }
}

/// Point-in-time copy of the counters held by [`MessagingMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Envelopes appended.
    pub sent: u64,
    /// Envelopes handed to handlers.
    pub consumed: u64,
    /// Items that failed to decode.
    pub malformed: u64,
    /// Failed handler invocations.
    pub handler_failures: u64,
    /// Expired request/response calls.
    pub rpc_timeouts: u64,
    /// Running pop-loops.
    pub active_workers: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_exporter_records_counts() {
        let registry = Registry::new();
        let metrics = MessagingMetrics::register(&registry).expect("register metrics");
        metrics.observe_sent();
        metrics.observe_consumed();
        metrics.observe_malformed();
        metrics.observe_rpc_timeout();
        metrics.observe_rpc_latency(Duration::from_millis(10));
        metrics.add_active_workers(2);
        metrics.add_active_workers(-1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.malformed, 1);
        assert_eq!(snapshot.handler_failures, 0);
        assert_eq!(snapshot.active_workers, 1);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "rq_messages_sent_total"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        MessagingMetrics::register(&registry).expect("first registration");
        assert!(MessagingMetrics::register(&registry).is_err());
    }
}
