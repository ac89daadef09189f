//! ---
//! rq_section: "04-broker-runtime"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Request/response correlation over blocking FIFO stores."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rq_common::RpcStrategy;
use rq_logging::{rq_debug, LogContext, Logger};
use rq_msg::{
    log_message, Envelope, EnvelopeError, MessageDirection, MessagingMetrics, QueueClient,
    RpcRequest, RpcResponse,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{BrokerError, Result};

/// A caller waiting for its response.
struct PendingCall {
    sender: oneshot::Sender<RpcResponse>,
    deadline: Instant,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingCall>>>;

/// Removes a pending entry when the waiting caller returns, whatever the outcome.
struct PendingGuard {
    pending: PendingTable,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

/// Dedicated loop popping the broker's backchannel and resolving pending calls.
#[derive(Clone)]
struct Backchannel {
    key: String,
    client: Arc<dyn QueueClient>,
    logger: Arc<dyn Logger>,
    metrics: Option<MessagingMetrics>,
    pending: PendingTable,
    pop_error_backoff: Duration,
    /// Handle of the running loop; cleared by the loop itself when it halts.
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Backchannel {
    async fn run(self) {
        let keys = [self.key.clone()];
        info!(channel = %self.key, store = self.client.name(), "response listener started");
        loop {
            match self.client.blocking_pop(&keys, Duration::ZERO).await {
                Ok(Some((_, raw))) => self.dispatch(&raw),
                Ok(None) => {}
                Err(err) if err.is_fatal() => {
                    self.logger.error(
                        &LogContext::new().with_channel(&self.key),
                        &format!("response listener stopped: {err}"),
                    );
                    // Dropping the senders resolves every waiting caller.
                    let mut task = self.task.lock();
                    self.pending.lock().clear();
                    task.take();
                    return;
                }
                Err(err) => {
                    self.logger.warn(
                        &LogContext::new().with_channel(&self.key),
                        &format!("response pop failed, retrying: {err}"),
                    );
                    tokio::time::sleep(self.pop_error_backoff).await;
                }
            }
        }
    }

    fn dispatch(&self, raw: &str) {
        let response = match decode_response(raw) {
            Ok(response) => response,
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_malformed();
                }
                self.logger.warn(
                    &LogContext::new().with_channel(&self.key),
                    &format!("dropping malformed response: {err}"),
                );
                return;
            }
        };
        let call = self.pending.lock().remove(&response.correlation_id);
        match call {
            Some(call) if Instant::now() <= call.deadline => {
                // The caller may have given up in the meantime; nothing to do then.
                let _ = call.sender.send(response);
            }
            Some(_) | None => {
                debug!(
                    channel = %self.key,
                    correlation_id = %response.correlation_id,
                    "dropping response for unknown or expired call"
                );
            }
        }
    }
}

fn decode_response(raw: &str) -> std::result::Result<RpcResponse, EnvelopeError> {
    let envelope = Envelope::decode(raw)?;
    RpcResponse::from_payload(&envelope.payload)
}

/// Pairs outgoing requests with their responses.
///
/// With [`RpcStrategy::SharedBackchannel`] a single background loop per
/// correlator pops every response and hands it to the matching caller; with
/// [`RpcStrategy::PerCall`] each caller pops its own response key.
pub struct RpcCorrelator {
    id: String,
    namespace: String,
    strategy: RpcStrategy,
    backchannel: Backchannel,
}

impl RpcCorrelator {
    pub(crate) fn new(
        namespace: &str,
        strategy: RpcStrategy,
        client: Arc<dyn QueueClient>,
        logger: Arc<dyn Logger>,
        metrics: Option<MessagingMetrics>,
        pop_error_backoff: Duration,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            backchannel: Backchannel {
                key: format!("{namespace}:rpc:backchannel:{id}"),
                client,
                logger,
                metrics,
                pending: Arc::default(),
                pop_error_backoff,
                task: Arc::default(),
            },
            namespace: namespace.to_owned(),
            strategy,
            id,
        }
    }

    /// Identifier embedded in the backchannel key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Key carrying responses for the shared strategy.
    pub fn backchannel_key(&self) -> &str {
        &self.backchannel.key
    }

    /// Correlation strategy chosen at construction.
    pub fn strategy(&self) -> RpcStrategy {
        self.strategy
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.backchannel.pending.lock().len()
    }

    /// Send `message` as a request to `channel` and wait for its response.
    pub async fn call(
        &self,
        channel: &str,
        message: &str,
        trace_id: Option<&str>,
        timeout: Duration,
    ) -> Result<String> {
        if timeout.is_zero() {
            return Err(BrokerError::InvalidArgument(
                "rpc timeout must be greater than zero".into(),
            ));
        }
        let started = Instant::now();
        let deadline = started + timeout;
        let correlation_id = Uuid::new_v4().to_string();
        let response = match self.strategy {
            RpcStrategy::SharedBackchannel => {
                self.call_shared(channel, message, trace_id, &correlation_id, deadline)
                    .await?
            }
            RpcStrategy::PerCall => {
                self.call_per_call(channel, message, trace_id, &correlation_id, deadline)
                    .await?
            }
        };
        let Some(response) = response else {
            if let Some(metrics) = &self.backchannel.metrics {
                metrics.observe_rpc_timeout();
            }
            rq_debug!(
                context = LogContext::new()
                    .with_channel(channel)
                    .with_correlation_id(&correlation_id),
                "rpc call timed out after {:?}",
                timeout
            );
            return Err(BrokerError::Timeout {
                channel: channel.to_owned(),
                correlation_id,
                timeout,
            });
        };
        if let Some(error) = response.error {
            return Err(BrokerError::Remote(error));
        }
        if let Some(metrics) = &self.backchannel.metrics {
            metrics.observe_rpc_latency(started.elapsed());
        }
        Ok(response.message)
    }

    async fn call_shared(
        &self,
        channel: &str,
        message: &str,
        trace_id: Option<&str>,
        correlation_id: &str,
        deadline: Instant,
    ) -> Result<Option<RpcResponse>> {
        let (sender, receiver) = oneshot::channel();
        self.backchannel
            .pending
            .lock()
            .insert(correlation_id.to_owned(), PendingCall { sender, deadline });
        let _guard = PendingGuard {
            pending: Arc::clone(&self.backchannel.pending),
            correlation_id: correlation_id.to_owned(),
        };
        self.ensure_listener();

        self.append_request(channel, message, trace_id, correlation_id, &self.backchannel.key)
            .await?;

        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Err(BrokerError::ListenerStopped {
                correlation_id: correlation_id.to_owned(),
            }),
            Err(_) => Ok(None),
        }
    }

    async fn call_per_call(
        &self,
        channel: &str,
        message: &str,
        trace_id: Option<&str>,
        correlation_id: &str,
        deadline: Instant,
    ) -> Result<Option<RpcResponse>> {
        let response_key = format!("{}:rpc:response:{correlation_id}", self.namespace);
        self.append_request(channel, message, trace_id, correlation_id, &response_key)
            .await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let popped = if remaining.is_zero() {
            Ok(None)
        } else {
            let keys = [response_key.clone()];
            let pop = self.backchannel.client.blocking_pop(&keys, remaining);
            tokio::time::timeout_at(deadline, pop)
                .await
                .unwrap_or(Ok(None))
        };

        if let Err(err) = self.backchannel.client.delete(&response_key).await {
            self.backchannel.logger.warn(
                &LogContext::new()
                    .with_channel(&response_key)
                    .with_correlation_id(correlation_id),
                &format!("failed to delete response key: {err}"),
            );
        }

        match popped? {
            Some((_, raw)) => Ok(Some(decode_response(&raw)?)),
            None => Ok(None),
        }
    }

    async fn append_request(
        &self,
        channel: &str,
        message: &str,
        trace_id: Option<&str>,
        correlation_id: &str,
        response_channel: &str,
    ) -> Result<()> {
        let request = RpcRequest {
            correlation_id: correlation_id.to_owned(),
            message: message.to_owned(),
            response_channel: response_channel.to_owned(),
        };
        let envelope = Envelope::new(request.to_payload()?, trace_id);
        self.backchannel
            .client
            .append(channel, &envelope.encode()?)
            .await?;
        log_message(MessageDirection::Outbound, channel, &envelope);
        if let Some(metrics) = &self.backchannel.metrics {
            metrics.observe_sent();
        }
        rq_debug!(
            context = LogContext::new()
                .with_channel(channel)
                .with_trace_id(&envelope.trace_id)
                .with_correlation_id(correlation_id),
            "rpc request sent; awaiting response on {}",
            response_channel
        );
        Ok(())
    }

    fn ensure_listener(&self) {
        let mut task = self.backchannel.task.lock();
        if task.as_ref().map_or(true, JoinHandle::is_finished) {
            *task = Some(tokio::spawn(self.backchannel.clone().run()));
        }
    }

    /// Stop the backchannel loop and remove its key.
    ///
    /// Calls still waiting resolve with [`BrokerError::ListenerStopped`].
    pub async fn close(&self) {
        if let Some(task) = self.backchannel.task.lock().take() {
            task.abort();
        }
        self.backchannel.pending.lock().clear();
        if let Err(err) = self.backchannel.client.delete(&self.backchannel.key).await {
            self.backchannel.logger.warn(
                &LogContext::new().with_channel(&self.backchannel.key),
                &format!("failed to delete backchannel: {err}"),
            );
        }
    }
}

impl Drop for RpcCorrelator {
    fn drop(&mut self) {
        if let Some(task) = self.backchannel.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rq_logging::TracingLogger;
    use rq_msg::InMemoryQueue;
    use tokio::time::{sleep, timeout};

    fn correlator(queue: &InMemoryQueue, strategy: RpcStrategy) -> Arc<RpcCorrelator> {
        Arc::new(RpcCorrelator::new(
            "rq",
            strategy,
            Arc::new(queue.clone()),
            Arc::new(TracingLogger),
            None,
            Duration::from_millis(10),
        ))
    }

    /// Pop one request from `channel` and answer it with `reply(message)`.
    async fn answer_once(queue: &InMemoryQueue, channel: &str, reply: &str) -> RpcRequest {
        let (_, raw) = queue
            .blocking_pop(&[channel.to_owned()], Duration::from_secs(2))
            .await
            .expect("pop")
            .expect("request arrives");
        let envelope = Envelope::decode(&raw).expect("envelope");
        let request = RpcRequest::from_payload(&envelope.payload).expect("request");
        let response = RpcResponse::ok(request.correlation_id.clone(), reply);
        let raw = Envelope::new(response.to_payload().expect("payload"), Some(&envelope.trace_id))
            .encode()
            .expect("encode");
        queue
            .append(&request.response_channel, &raw)
            .await
            .expect("append");
        request
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_backchannel_resolves_concurrent_calls_by_id() {
        let queue = InMemoryQueue::new();
        let correlator = correlator(&queue, RpcStrategy::SharedBackchannel);

        let mut calls = Vec::new();
        for i in 0..3 {
            let correlator = Arc::clone(&correlator);
            calls.push(tokio::spawn(async move {
                correlator
                    .call("rpc:test", &format!("ping-{i}"), None, Duration::from_secs(2))
                    .await
            }));
        }

        // Answer in reverse arrival order so routing relies on the correlation id.
        let mut requests = Vec::new();
        for _ in 0..3 {
            let (_, raw) = queue
                .blocking_pop(&["rpc:test".to_owned()], Duration::from_secs(2))
                .await
                .expect("pop")
                .expect("request");
            let envelope = Envelope::decode(&raw).expect("envelope");
            requests.push(RpcRequest::from_payload(&envelope.payload).expect("request"));
        }
        for request in requests.iter().rev() {
            assert_eq!(request.response_channel, correlator.backchannel_key());
            let reply = RpcResponse::ok(
                request.correlation_id.clone(),
                request.message.replace("ping", "pong"),
            );
            let raw = Envelope::new(reply.to_payload().expect("payload"), None)
                .encode()
                .expect("encode");
            queue
                .append(&request.response_channel, &raw)
                .await
                .expect("append");
        }

        for (i, call) in calls.into_iter().enumerate() {
            let answer = call.await.expect("join").expect("call");
            assert_eq!(answer, format!("pong-{i}"));
        }
        assert_eq!(correlator.pending_calls(), 0);
        correlator.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_removes_the_pending_entry_and_late_responses_are_dropped() {
        let queue = InMemoryQueue::new();
        let correlator = correlator(&queue, RpcStrategy::SharedBackchannel);

        let started = Instant::now();
        let err = correlator
            .call("rpc:nobody", "ping", None, Duration::from_millis(200))
            .await
            .expect_err("nobody answers");
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(correlator.pending_calls(), 0);

        // A late answer for the expired call is swallowed by the listener.
        answer_once(&queue, "rpc:nobody", "too late").await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(correlator.backchannel_key()), 0);
        correlator.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn per_call_strategy_uses_and_removes_its_own_key() {
        let queue = InMemoryQueue::new();
        let correlator = correlator(&queue, RpcStrategy::PerCall);
        let responder = {
            let queue = queue.clone();
            tokio::spawn(async move { answer_once(&queue, "rpc:test", "pong").await })
        };

        let answer = correlator
            .call("rpc:test", "ping", Some("trace-7"), Duration::from_secs(2))
            .await
            .expect("call");
        assert_eq!(answer, "pong");

        let request = responder.await.expect("join");
        assert_eq!(request.message, "ping");
        assert_eq!(
            request.response_channel,
            format!("rq:rpc:response:{}", request.correlation_id)
        );
        assert_eq!(queue.len(&request.response_channel), 0);
        assert_eq!(correlator.pending_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explicit_error_records_fail_fast() {
        let queue = InMemoryQueue::new();
        let correlator = correlator(&queue, RpcStrategy::SharedBackchannel);
        let responder = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let (_, raw) = queue
                    .blocking_pop(&["rpc:test".to_owned()], Duration::from_secs(2))
                    .await
                    .expect("pop")
                    .expect("request");
                let envelope = Envelope::decode(&raw).expect("envelope");
                let request = RpcRequest::from_payload(&envelope.payload).expect("request");
                let failed = RpcResponse::failed(request.correlation_id, "boom");
                let raw = Envelope::new(failed.to_payload().expect("payload"), None)
                    .encode()
                    .expect("encode");
                queue
                    .append(&request.response_channel, &raw)
                    .await
                    .expect("append");
            })
        };

        let err = correlator
            .call("rpc:test", "ping", None, Duration::from_secs(2))
            .await
            .expect_err("remote failure");
        assert!(matches!(err, BrokerError::Remote(ref message) if message == "boom"));
        responder.await.expect("join");
        correlator.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_responses_do_not_stop_the_listener() {
        let queue = InMemoryQueue::new();
        let correlator = correlator(&queue, RpcStrategy::SharedBackchannel);
        let responder = {
            let queue = queue.clone();
            let backchannel = correlator.backchannel_key().to_owned();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                queue.append(&backchannel, "garbage").await.expect("append");
                answer_once(&queue, "rpc:test", "pong").await
            })
        };

        let answer = correlator
            .call("rpc:test", "ping", None, Duration::from_secs(2))
            .await
            .expect("call");
        assert_eq!(answer, "pong");
        responder.await.expect("join");
        correlator.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lost_connection_resolves_waiting_callers() {
        let queue = InMemoryQueue::new();
        let correlator = correlator(&queue, RpcStrategy::SharedBackchannel);
        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .call("rpc:test", "ping", None, Duration::from_secs(5))
                    .await
            })
        };
        timeout(Duration::from_secs(1), async {
            while queue.len("rpc:test") == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("request appended");

        queue.disconnect();
        let err = timeout(Duration::from_secs(1), call)
            .await
            .expect("resolved before the rpc timeout")
            .expect("join")
            .expect_err("listener stopped");
        assert!(matches!(err, BrokerError::ListenerStopped { .. }));
        assert_eq!(correlator.pending_calls(), 0);

        // The next call respawns the listener.
        queue.reconnect();
        let responder = {
            let queue = queue.clone();
            tokio::spawn(async move {
                // Discard the request orphaned by the disconnect.
                queue
                    .blocking_pop(&["rpc:test".to_owned()], Duration::from_secs(2))
                    .await
                    .expect("pop");
                answer_once(&queue, "rpc:test", "pong").await
            })
        };
        let answer = correlator
            .call("rpc:test", "ping", None, Duration::from_secs(2))
            .await
            .expect("call after reconnect");
        assert_eq!(answer, "pong");
        responder.await.expect("join");
        correlator.close().await;
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let queue = InMemoryQueue::new();
        let correlator = correlator(&queue, RpcStrategy::SharedBackchannel);
        let err = correlator
            .call("rpc:test", "ping", None, Duration::ZERO)
            .await
            .expect_err("invalid");
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
        assert_eq!(queue.len("rpc:test"), 0);
    }

    #[tokio::test]
    async fn append_failures_surface_as_store_errors() {
        let queue = InMemoryQueue::new();
        let correlator = correlator(&queue, RpcStrategy::SharedBackchannel);
        queue.disconnect();
        let err = correlator
            .call("rpc:test", "ping", None, Duration::from_secs(1))
            .await
            .expect_err("store down");
        assert!(matches!(err, BrokerError::Store(_)));
        assert_eq!(correlator.pending_calls(), 0);
    }
}
