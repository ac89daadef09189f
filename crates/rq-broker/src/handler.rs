//! ---
//! rq_section: "04-broker-runtime"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Handler contracts invoked by listeners and responders."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
use std::any::Any;
use std::future::Future;

use async_trait::async_trait;
use rq_msg::EnvelopeError;

/// Business logic invoked once per consumed envelope.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one payload. Errors are reported, never propagated out of the pool.
    async fn handle(&self, payload: String, trace_id: String) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: String, trace_id: String) -> anyhow::Result<()> {
        (self)(payload, trace_id).await
    }
}

/// Business logic answering one request/response call.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Produce the response message for `message`.
    async fn respond(&self, message: String, trace_id: String) -> anyhow::Result<String>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn respond(&self, message: String, trace_id: String) -> anyhow::Result<String> {
        (self)(message, trace_id).await
    }
}

/// Failures a running listener reports instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The item (or the request record inside it) could not be decoded.
    #[error(transparent)]
    Malformed(#[from] EnvelopeError),
    /// The handler returned an error.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Callback receiving listener failures together with the raw queue item.
pub trait ErrorHandler: Send + Sync + 'static {
    /// `trace_id` is `None` when the item did not decode far enough to carry one.
    fn on_error(&self, error: &ListenerError, raw: &str, trace_id: Option<&str>);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ListenerError, &str, Option<&str>) + Send + Sync + 'static,
{
    fn on_error(&self, error: &ListenerError, raw: &str, trace_id: Option<&str>) {
        (self)(error, raw, trace_id)
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
