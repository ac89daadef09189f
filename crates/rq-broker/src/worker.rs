//! ---
//! rq_section: "04-broker-runtime"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Resizable pool of pop-loops draining one queue key."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
//! Worker pool draining a single queue key.
//!
//! Every concurrency slot is one pop-loop: blocking pop, handle, repeat. An
//! idle slot parks on the store, so nothing is fetched ahead of the capacity
//! to process it. Shutdown pushes one sentinel per loop to a pool-private key
//! so blocked loops wake up, then waits until every loop has left. Sentinels
//! carry the generation they were sent for; loops ignore any other.
//!
//! A fatal store error, or a `stop()` that does not run to completion,
//! retires the whole generation at once: idle loops abandon their pop and
//! busy loops leave after their current handler.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use rq_logging::{LogContext, Logger};
use rq_msg::{log_message, Envelope, MessageDirection, MessagingMetrics, QueueClient, QueueError};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::handler::{panic_message, ErrorHandler, ListenerError, MessageHandler};
use crate::Result;

/// Loops kept parked on the store by a pool without a ceiling.
pub const UNBOUNDED_BOOTSTRAP_LOOPS: usize = 1;

/// Instantaneous view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Pop-loops currently alive.
    pub active_workers: usize,
    /// Concurrency ceiling, `0` when unbounded.
    pub worklimit: usize,
}

/// Lifecycle phase of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    /// `stop()` is waiting for in-flight handlers to finish.
    Draining,
}

/// Everything a pool needs besides its handlers.
#[derive(Clone)]
pub(crate) struct WorkerSettings {
    pub client: Arc<dyn QueueClient>,
    pub logger: Arc<dyn Logger>,
    pub metrics: Option<MessagingMetrics>,
    pub pop_timeout: Duration,
    pub pop_error_backoff: Duration,
}

#[derive(Debug, Default)]
struct PoolState {
    limit: usize,
    active: usize,
    busy: usize,
    running: bool,
    draining: bool,
    /// Bumped on every start and on fatal halts; loops of an older generation
    /// leave without touching the counters.
    generation: u64,
}

impl PoolState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

struct WorkerInner {
    id: String,
    channel: String,
    shutdown_key: String,
    keys: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    settings: WorkerSettings,
    state: Mutex<PoolState>,
    /// Mirrors `PoolState::generation`; parked loops race their pop against it.
    generations: watch::Sender<u64>,
    idle: Notify,
    stop_lock: tokio::sync::Mutex<()>,
}

/// Handle to a pool of pop-loops bound to one queue key.
///
/// Cloning the handle is cheap; all clones control the same pool.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub(crate) fn new(
        channel: &str,
        handler: Arc<dyn MessageHandler>,
        error_handler: Option<Arc<dyn ErrorHandler>>,
        worklimit: usize,
        settings: WorkerSettings,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let shutdown_key = format!("{channel}:shutdown:{id}");
        Self {
            inner: Arc::new(WorkerInner {
                keys: vec![channel.to_owned(), shutdown_key.clone()],
                channel: channel.to_owned(),
                shutdown_key,
                id,
                handler,
                error_handler,
                settings,
                state: Mutex::new(PoolState {
                    limit: worklimit,
                    ..PoolState::default()
                }),
                generations: watch::channel(0).0,
                idle: Notify::new(),
                stop_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Unique identifier of this pool.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Queue key drained by this pool.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Key receiving this pool's shutdown sentinels.
    pub fn shutdown_key(&self) -> &str {
        &self.inner.shutdown_key
    }

    /// Start the pop-loops. Does nothing unless the pool is stopped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.running || state.draining {
            debug!(channel = %self.inner.channel, worker = %self.inner.id, "start ignored; pool not stopped");
            return;
        }
        state.running = true;
        state.busy = 0;
        self.inner.advance_generation_locked(&mut state);
        let initial = loop_target(state.limit);
        self.inner.spawn_loops_locked(&mut state, initial);
        info!(
            channel = %self.inner.channel,
            worker = %self.inner.id,
            worklimit = state.limit,
            loops = initial,
            "listener started"
        );
    }

    /// Stop accepting work and wait for in-flight handlers to finish.
    ///
    /// Handlers already running are never cancelled. Safe to call on a pool
    /// that is already stopped.
    ///
    /// If the returned future is dropped early, or a sentinel cannot be
    /// written, the pool is left stopped with every loop retired, and
    /// `start()` works again right away.
    pub async fn stop(&self) -> Result<()> {
        let _serialised = self.inner.stop_lock.lock().await;
        let (generation, sentinels) = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.draining = true;
            (state.generation, state.active)
        };
        let mut drain = DrainGuard {
            inner: self.inner.as_ref(),
            generation,
            settled: false,
        };
        debug!(channel = %self.inner.channel, worker = %self.inner.id, sentinels, generation, "draining listener");

        let sentinel = Envelope::new(generation.to_string(), Some(&self.inner.id)).encode()?;
        for _ in 0..sentinels {
            self.inner
                .settings
                .client
                .append(&self.inner.shutdown_key, &sentinel)
                .await?;
        }

        self.inner.wait_idle().await;
        let cleared = self
            .inner
            .settings
            .client
            .delete(&self.inner.shutdown_key)
            .await;
        drain.settle();
        cleared?;
        info!(channel = %self.inner.channel, worker = %self.inner.id, "listener stopped");
        Ok(())
    }

    /// Change the concurrency ceiling.
    ///
    /// Raising it on a running pool spawns the missing loops right away.
    /// Lowering it never interrupts a loop; surplus loops leave once their
    /// current pop and handler complete.
    pub fn set_worklimit(&self, worklimit: usize) {
        let mut state = self.inner.state.lock();
        state.limit = worklimit;
        if state.running {
            let missing = loop_target(worklimit).saturating_sub(state.active);
            self.inner.spawn_loops_locked(&mut state, missing);
        }
        debug!(channel = %self.inner.channel, worker = %self.inner.id, worklimit, active = state.active, "worklimit updated");
    }

    /// Snapshot of the active loop count and ceiling.
    pub fn get_stats(&self) -> WorkerStats {
        let state = self.inner.state.lock();
        WorkerStats {
            active_workers: state.active,
            worklimit: state.limit,
        }
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> WorkerState {
        let state = self.inner.state.lock();
        if state.running {
            WorkerState::Running
        } else if state.draining {
            WorkerState::Draining
        } else {
            WorkerState::Stopped
        }
    }
}

/// Retires the draining generation unless `stop()` settles it first.
struct DrainGuard<'a> {
    inner: &'a WorkerInner,
    generation: u64,
    settled: bool,
}

impl DrainGuard<'_> {
    fn settle(&mut self) {
        self.settled = true;
        self.inner.state.lock().draining = false;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.is_current(self.generation) {
            self.inner.retire_locked(&mut state);
        }
        state.draining = false;
        debug!(
            channel = %self.inner.channel,
            worker = %self.inner.id,
            "drain abandoned; remaining loops retired"
        );
    }
}

fn sentinel_generation(raw: &str) -> Option<u64> {
    Envelope::decode(raw).ok()?.payload.parse().ok()
}

/// Resolves once the pool has moved past `generation`.
async fn retired(generations: &mut watch::Receiver<u64>, generation: u64) {
    let _ = generations.wait_for(|current| *current != generation).await;
}

fn loop_target(limit: usize) -> usize {
    if limit == 0 {
        UNBOUNDED_BOOTSTRAP_LOOPS
    } else {
        limit
    }
}

impl WorkerInner {
    fn context(&self) -> LogContext<'_> {
        LogContext::new()
            .with_channel(&self.channel)
            .with_worker(&self.id)
    }

    fn spawn_loops_locked(self: &Arc<Self>, state: &mut PoolState, count: usize) {
        if count == 0 {
            return;
        }
        for _ in 0..count {
            state.active += 1;
            let inner = Arc::clone(self);
            let generation = state.generation;
            tokio::spawn(async move { inner.run_loop(generation).await });
        }
        if let Some(metrics) = &self.settings.metrics {
            metrics.add_active_workers(count as i64);
        }
    }

    async fn run_loop(self: Arc<Self>, generation: u64) {
        let mut generations = self.generations.subscribe();
        while !self.leave_if_done(generation, false) {
            let popped = tokio::select! {
                popped = self
                    .settings
                    .client
                    .blocking_pop(&self.keys, self.settings.pop_timeout) => popped,
                _ = retired(&mut generations, generation) => break,
            };
            match popped {
                Ok(Some((key, raw))) if !self.is_current(generation) => {
                    self.hand_back(&key, &raw).await;
                    break;
                }
                Ok(None) => {}
                Ok(Some((key, raw))) if key == self.shutdown_key => {
                    if sentinel_generation(&raw) == Some(generation) {
                        self.leave_if_done(generation, true);
                        break;
                    }
                    debug!(channel = %self.channel, worker = %self.id, "discarding stale shutdown sentinel");
                }
                Ok(Some((_, raw))) => {
                    if let Some(fatal) = self.process(generation, raw).await {
                        self.halt(generation, &fatal);
                        break;
                    }
                }
                Err(err) if err.is_fatal() => {
                    self.halt(generation, &err);
                    break;
                }
                Err(err) => {
                    self.settings.logger.warn(
                        &self.context(),
                        &format!("blocking pop failed, retrying: {err}"),
                    );
                    tokio::time::sleep(self.settings.pop_error_backoff).await;
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().is_current(generation)
    }

    fn advance_generation_locked(&self, state: &mut PoolState) {
        state.generation += 1;
        self.generations.send_replace(state.generation);
    }

    /// Drop every loop of the current generation from the books at once.
    fn retire_locked(&self, state: &mut PoolState) {
        if let Some(metrics) = &self.settings.metrics {
            metrics.add_active_workers(-(state.active as i64));
        }
        state.running = false;
        state.active = 0;
        state.busy = 0;
        self.advance_generation_locked(state);
        self.idle.notify_waiters();
    }

    /// Return an item popped by a loop that was retired mid-pop.
    async fn hand_back(&self, key: &str, raw: &str) {
        if key == self.shutdown_key {
            let live = sentinel_generation(raw).is_some_and(|g| self.is_current(g));
            if !live {
                return;
            }
        }
        if let Err(err) = self.settings.client.append(key, raw).await {
            self.settings.logger.error(
                &self.context(),
                &format!("item popped by a retired loop could not be returned to {key}: {err}"),
            );
        }
    }

    /// Decide whether the calling loop must exit and, if so, account for it.
    fn leave_if_done(&self, generation: u64, force: bool) -> bool {
        let mut state = self.state.lock();
        if !state.is_current(generation) {
            return true;
        }
        let over_ceiling = if state.limit == 0 {
            state.active - state.busy > UNBOUNDED_BOOTSTRAP_LOOPS
        } else {
            state.active > state.limit
        };
        if !(force || !state.running || over_ceiling) {
            return false;
        }
        state.active -= 1;
        if let Some(metrics) = &self.settings.metrics {
            metrics.add_active_workers(-1);
        }
        if state.active == 0 {
            self.idle.notify_waiters();
        }
        true
    }

    /// Handle one raw item; returns a fatal store error that must stop the pool.
    async fn process(self: &Arc<Self>, generation: u64, raw: String) -> Option<QueueError> {
        let envelope = match Envelope::decode(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.report(ListenerError::Malformed(err), &raw, None);
                return None;
            }
        };
        log_message(MessageDirection::Inbound, &self.channel, &envelope);
        if let Some(metrics) = &self.settings.metrics {
            metrics.observe_consumed();
        }

        self.begin_job(generation);
        let outcome = AssertUnwindSafe(
            self.handler
                .handle(envelope.payload, envelope.trace_id.clone()),
        )
        .catch_unwind()
        .await;
        self.end_job(generation);

        match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                let fatal = err
                    .chain()
                    .find_map(|cause| cause.downcast_ref::<QueueError>())
                    .filter(|cause| cause.is_fatal())
                    .cloned();
                let error = match err.downcast::<rq_msg::EnvelopeError>() {
                    Ok(malformed) => ListenerError::Malformed(malformed),
                    Err(err) => ListenerError::Handler(err),
                };
                self.report(error, &raw, Some(&envelope.trace_id));
                fatal
            }
            Err(panic) => {
                self.report(
                    ListenerError::Panicked(panic_message(panic)),
                    &raw,
                    Some(&envelope.trace_id),
                );
                None
            }
        }
    }

    fn begin_job(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if !state.is_current(generation) {
            return;
        }
        state.busy += 1;
        // Without a ceiling, keep one loop parked on the store at all times.
        if state.running && state.limit == 0 && state.busy >= state.active {
            self.spawn_loops_locked(&mut state, 1);
        }
    }

    fn end_job(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.is_current(generation) {
            state.busy = state.busy.saturating_sub(1);
        }
    }

    fn report(&self, error: ListenerError, raw: &str, trace_id: Option<&str>) {
        if let Some(metrics) = &self.settings.metrics {
            match error {
                ListenerError::Malformed(_) => metrics.observe_malformed(),
                ListenerError::Handler(_) | ListenerError::Panicked(_) => {
                    metrics.observe_handler_failure()
                }
            }
        }
        if let Some(handler) = &self.error_handler {
            handler.on_error(&error, raw, trace_id);
            return;
        }
        let mut context = self.context();
        if let Some(trace_id) = trace_id {
            context = context.with_trace_id(trace_id);
        }
        match error {
            ListenerError::Malformed(_) => self
                .settings
                .logger
                .warn(&context, &format!("skipping malformed message: {error}")),
            _ => self.settings.logger.error(&context, &error.to_string()),
        }
    }

    /// Stop the whole pool after the store connection became unusable.
    fn halt(&self, generation: u64, err: &QueueError) {
        {
            let mut state = self.state.lock();
            if !state.is_current(generation) {
                return;
            }
            self.retire_locked(&mut state);
        }
        self.settings.logger.error(
            &self.context(),
            &format!("queue connection unusable, listener stopped: {err}"),
        );
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().active == 0 {
                return;
            }
            notified.await;
        }
    }
}
