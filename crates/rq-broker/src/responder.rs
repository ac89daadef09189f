//! ---
//! rq_section: "04-broker-runtime"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Adapter answering request/response calls from a worker pool."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::FutureExt;
use rq_common::RpcErrorPolicy;
use rq_logging::{rq_debug, LogContext};
use rq_msg::{
    log_message, Envelope, MessageDirection, MessagingMetrics, QueueClient, RpcRequest,
    RpcResponse,
};

use crate::handler::{panic_message, MessageHandler, RpcHandler};

/// Pool handler that decodes requests, runs the user handler and pushes the answer.
pub(crate) struct Responder {
    handler: Arc<dyn RpcHandler>,
    client: Arc<dyn QueueClient>,
    policy: RpcErrorPolicy,
    metrics: Option<MessagingMetrics>,
}

impl Responder {
    pub(crate) fn new(
        handler: Arc<dyn RpcHandler>,
        client: Arc<dyn QueueClient>,
        policy: RpcErrorPolicy,
        metrics: Option<MessagingMetrics>,
    ) -> Self {
        Self {
            handler,
            client,
            policy,
            metrics,
        }
    }

    async fn push(
        &self,
        request: &RpcRequest,
        response: &RpcResponse,
        trace_id: &str,
    ) -> anyhow::Result<()> {
        let envelope = Envelope::new(response.to_payload()?, Some(trace_id));
        self.client
            .append(&request.response_channel, &envelope.encode()?)
            .await?;
        log_message(
            MessageDirection::Outbound,
            &request.response_channel,
            &envelope,
        );
        if let Some(metrics) = &self.metrics {
            metrics.observe_sent();
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Responder {
    async fn handle(&self, payload: String, trace_id: String) -> anyhow::Result<()> {
        // Returned unwrapped so the pool classifies it as a malformed item.
        let request = RpcRequest::from_payload(&payload)?;
        rq_debug!(
            context = LogContext::new()
                .with_trace_id(&trace_id)
                .with_correlation_id(&request.correlation_id),
            "answering rpc request"
        );

        let outcome = AssertUnwindSafe(
            self.handler
                .respond(request.message.clone(), trace_id.clone()),
        )
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(anyhow!("rpc handler panicked: {}", panic_message(panic))));

        let err = match outcome {
            Ok(message) => {
                let response = RpcResponse::ok(request.correlation_id.clone(), message);
                return self
                    .push(&request, &response, &trace_id)
                    .await
                    .with_context(|| {
                        format!(
                            "failed to push rpc response to {}",
                            request.response_channel
                        )
                    });
            }
            Err(err) => err,
        };

        if self.policy == RpcErrorPolicy::Reply {
            let response = RpcResponse::failed(request.correlation_id.clone(), format!("{err:#}"));
            if let Err(push_err) = self.push(&request, &response, &trace_id).await {
                return Err(push_err.context(format!(
                    "failed to push rpc error record after handler failure ({err:#})"
                )));
            }
        }
        Err(err.context(format!(
            "rpc handler failed for call {}",
            request.correlation_id
        )))
    }
}
