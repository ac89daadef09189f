//! ---
//! rq_section: "02-messaging-data-model"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Wire types, store plumbing and messaging metrics."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
//! Wire types and store plumbing shared by every R-MQ component.
//!
//! Every item placed on a queue key is a JSON [`Envelope`]. Request/response
//! calls nest an [`RpcRequest`] or [`RpcResponse`] record inside the envelope
//! payload. The store itself is reached through the [`QueueClient`] trait.

#![warn(missing_docs)]

pub mod envelope;
pub mod metrics;
pub mod transport;

pub use envelope::{Envelope, EnvelopeError, RpcRequest, RpcResponse};
pub use metrics::{log_message, MessageDirection, MessagingMetrics, MetricsSnapshot};
pub use transport::{InMemoryQueue, QueueClient, QueueError};

/// Shared result type for store operations.
pub type Result<T> = std::result::Result<T, QueueError>;
