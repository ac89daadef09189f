//! ---
//! rq_section: "03-logging"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Structured logging adapters and sinks."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---

/// Internal helper expanding a [`LogContext`](crate::LogContext) into tracing fields.
#[doc(hidden)]
#[macro_export]
macro_rules! __rq_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            channel = ctx.channel.unwrap_or(""),
            trace_id = ctx.trace_id.unwrap_or(""),
            correlation_id = ctx.correlation_id.unwrap_or(""),
            worker = ctx.worker.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit a debug log enriched with queue context.
#[macro_export]
macro_rules! rq_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__rq_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__rq_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an informational log enriched with queue context.
#[macro_export]
macro_rules! rq_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__rq_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__rq_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with queue context.
#[macro_export]
macro_rules! rq_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__rq_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__rq_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with queue context.
#[macro_export]
macro_rules! rq_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__rq_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__rq_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
