//! ---
//! rq_section: "04-broker-runtime"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Broker facade tying listeners, senders and rpc calls to one store."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use rq_common::BrokerConfig;
use rq_logging::{LogContext, Logger, TracingLogger};
use rq_msg::{log_message, Envelope, MessageDirection, MessagingMetrics, QueueClient};
use tracing::info;

use crate::correlator::RpcCorrelator;
use crate::handler::{ErrorHandler, MessageHandler, RpcHandler};
use crate::responder::Responder;
use crate::worker::{Worker, WorkerSettings};
use crate::{BrokerError, Result};

/// Per-listener options.
#[derive(Clone, Default)]
pub struct ListenOptions {
    /// Concurrency ceiling; falls back to `BrokerConfig::initial_worklimit`.
    pub worklimit: Option<usize>,
    /// Receives malformed items and handler failures instead of the logger.
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl ListenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worklimit(mut self, worklimit: usize) -> Self {
        self.worklimit = Some(worklimit);
        self
    }

    pub fn with_error_handler(mut self, handler: impl ErrorHandler) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

/// Entry point for sending, listening and request/response calls over one store.
pub struct Broker {
    client: Arc<dyn QueueClient>,
    config: BrokerConfig,
    logger: Arc<dyn Logger>,
    metrics: Option<MessagingMetrics>,
    correlator: RpcCorrelator,
}

impl Broker {
    pub fn new(client: Arc<dyn QueueClient>, config: BrokerConfig) -> Self {
        let logger: Arc<dyn Logger> = Arc::new(TracingLogger);
        let correlator = Self::correlator_for(&client, &config, &logger, None);
        info!(
            store = client.name(),
            namespace = %config.namespace,
            strategy = ?config.rpc_strategy,
            "broker created"
        );
        Self {
            client,
            config,
            logger,
            metrics: None,
            correlator,
        }
    }

    /// Replace the sink for reported warnings and errors.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self.rebuild_correlator();
        self
    }

    /// Record activity on the given metric handles.
    pub fn with_metrics(mut self, metrics: MessagingMetrics) -> Self {
        self.metrics = Some(metrics);
        self.rebuild_correlator();
        self
    }

    fn correlator_for(
        client: &Arc<dyn QueueClient>,
        config: &BrokerConfig,
        logger: &Arc<dyn Logger>,
        metrics: Option<MessagingMetrics>,
    ) -> RpcCorrelator {
        RpcCorrelator::new(
            &config.namespace,
            config.rpc_strategy,
            Arc::clone(client),
            Arc::clone(logger),
            metrics,
            config.pop_error_backoff,
        )
    }

    fn rebuild_correlator(&mut self) {
        self.correlator =
            Self::correlator_for(&self.client, &self.config, &self.logger, self.metrics.clone());
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn correlator(&self) -> &RpcCorrelator {
        &self.correlator
    }

    /// Append `message` to `channel`, returning the trace id it was sent with.
    pub async fn send(
        &self,
        channel: &str,
        message: &str,
        trace_id: Option<&str>,
    ) -> Result<String> {
        let envelope = Envelope::new(message, trace_id);
        self.client.append(channel, &envelope.encode()?).await?;
        log_message(MessageDirection::Outbound, channel, &envelope);
        if let Some(metrics) = &self.metrics {
            metrics.observe_sent();
        }
        Ok(envelope.trace_id)
    }

    /// Start a pool consuming `channel` with `handler`.
    pub fn listen<H: MessageHandler>(
        &self,
        channel: &str,
        handler: H,
        options: ListenOptions,
    ) -> Result<Worker> {
        self.spawn_worker(channel, Arc::new(handler), options)
    }

    /// Start a pool answering request/response calls sent to `channel`.
    pub fn listen_and_respond<H: RpcHandler>(
        &self,
        channel: &str,
        handler: H,
        options: ListenOptions,
    ) -> Result<Worker> {
        let responder = Responder::new(
            Arc::new(handler),
            Arc::clone(&self.client),
            self.config.rpc_error_policy,
            self.metrics.clone(),
        );
        self.spawn_worker(channel, Arc::new(responder), options)
    }

    fn spawn_worker(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
        options: ListenOptions,
    ) -> Result<Worker> {
        if channel.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "channel name cannot be empty".into(),
            ));
        }
        let worklimit = options.worklimit.unwrap_or(self.config.initial_worklimit);
        let worker = Worker::new(
            channel,
            handler,
            options.error_handler,
            worklimit,
            WorkerSettings {
                client: Arc::clone(&self.client),
                logger: Arc::clone(&self.logger),
                metrics: self.metrics.clone(),
                pop_timeout: self.config.pop_timeout,
                pop_error_backoff: self.config.pop_error_backoff,
            },
        );
        worker.start();
        Ok(worker)
    }

    /// Send a request to `channel` and wait for its response.
    ///
    /// `timeout` defaults to `BrokerConfig::rpc_timeout`.
    pub async fn send_and_wait_for_response(
        &self,
        channel: &str,
        message: &str,
        trace_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let timeout = timeout.unwrap_or(self.config.rpc_timeout);
        self.correlator
            .call(channel, message, trace_id, timeout)
            .await
            .map_err(|err| {
                if !err.is_timeout() {
                    self.logger.warn(
                        &LogContext::new().with_channel(channel),
                        &format!("rpc call failed: {err}"),
                    );
                }
                err
            })
    }

    /// Stop the response listener and remove the backchannel key.
    ///
    /// Listeners returned by [`listen`](Self::listen) are stopped through their own handles.
    pub async fn close(&self) {
        self.correlator.close().await;
        info!(namespace = %self.config.namespace, "broker closed");
    }
}
