//! ---
//! rq_section: "03-logging"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Structured logging adapters and sinks."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod macros;

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogContext<'a> {
    /// Queue key the event relates to.
    pub channel: Option<&'a str>,
    /// Trace identifier carried by the envelope.
    pub trace_id: Option<&'a str>,
    /// Correlation identifier of a request/response call.
    pub correlation_id: Option<&'a str>,
    /// Identifier of the worker pool emitting the event.
    pub worker: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a queue key.
    pub fn with_channel(mut self, channel: &'a str) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Attach a trace identifier.
    pub fn with_trace_id(mut self, trace_id: &'a str) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Attach a correlation identifier.
    pub fn with_correlation_id(mut self, correlation_id: &'a str) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach a worker pool identifier.
    pub fn with_worker(mut self, worker: &'a str) -> Self {
        self.worker = Some(worker);
        self
    }
}

/// Sink for the warnings and errors a broker reports instead of propagating.
///
/// Host applications may plug in their own implementation; the default
/// forwards to `tracing` via [`TracingLogger`].
pub trait Logger: Send + Sync {
    /// Report a recoverable problem (e.g. a malformed message that was skipped).
    fn warn(&self, context: &LogContext<'_>, message: &str);
    /// Report a failure (e.g. a handler error or a stopped listener).
    fn error(&self, context: &LogContext<'_>, message: &str);
}

/// Default [`Logger`] emitting structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn warn(&self, context: &LogContext<'_>, message: &str) {
        rq_warn!(context = *context, "{}", message);
    }

    fn error(&self, context: &LogContext<'_>, message: &str) {
        rq_error!(context = *context, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingLogger {
        lines: Mutex<Vec<String>>,
    }

    impl Logger for RecordingLogger {
        fn warn(&self, context: &LogContext<'_>, message: &str) {
            self.lines.lock().push(format!(
                "warn {} {}",
                context.channel.unwrap_or("-"),
                message
            ));
        }

        fn error(&self, context: &LogContext<'_>, message: &str) {
            self.lines.lock().push(format!(
                "error {} {}",
                context.channel.unwrap_or("-"),
                message
            ));
        }
    }

    #[test]
    fn macros_emit_without_panic() {
        let ctx = LogContext::new()
            .with_channel("jobs")
            .with_trace_id("trace-1");
        rq_info!(context = ctx, "listener online");
        rq_debug!("debug message");
        rq_error!(context = ctx, "error code: {}", 42);
    }

    #[test]
    fn tracing_logger_accepts_context() {
        let logger: Box<dyn Logger> = Box::new(TracingLogger);
        let ctx = LogContext::new().with_channel("jobs").with_worker("w-1");
        logger.warn(&ctx, "skipping malformed message");
        logger.error(&LogContext::default(), "handler failed");
    }

    #[test]
    fn custom_logger_receives_context() {
        let logger = RecordingLogger::default();
        let ctx = LogContext::new().with_channel("jobs");
        logger.warn(&ctx, "first");
        logger.error(&LogContext::new(), "second");
        assert_eq!(
            *logger.lines.lock(),
            vec!["warn jobs first".to_owned(), "error - second".to_owned()]
        );
    }
}
