//! ---
//! rq_section: "04-broker-runtime"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Worker pools, request/response correlation and the broker facade."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
//! Consumption engine of R-MQ.
//!
//! A [`Broker`] appends envelopes to queue keys, starts [`Worker`] pools that
//! drain them, and runs request/response calls through an [`RpcCorrelator`].

use std::time::Duration;

use rq_msg::{EnvelopeError, QueueError};

pub mod broker;
pub mod correlator;
pub mod handler;
mod responder;
pub mod worker;

pub use broker::{Broker, ListenOptions};
pub use correlator::RpcCorrelator;
pub use handler::{ErrorHandler, ListenerError, MessageHandler, RpcHandler};
pub use worker::{Worker, WorkerState, WorkerStats, UNBOUNDED_BOOTSTRAP_LOOPS};

/// Errors surfaced to callers of broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No response arrived before the deadline.
    #[error("no response on {channel} for call {correlation_id} within {timeout:?}")]
    Timeout {
        channel: String,
        correlation_id: String,
        timeout: Duration,
    },
    #[error(transparent)]
    Store(#[from] QueueError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// The responder answered with an explicit error record.
    #[error("responder failed: {0}")]
    Remote(String),
    /// The shared response listener stopped before this call resolved.
    #[error("response listener stopped before call {correlation_id} resolved")]
    ListenerStopped { correlation_id: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BrokerError {
    /// Whether the call failed only because nobody answered in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
