//! Change-feed subscription engine.
//!
//! A [`SubscriptionEngine`] tails the underlying log's change feed and
//! delivers deserialized events to consumer callbacks. Each subscription
//! runs as one independent tokio task: it opens a feed with the compiled
//! filter pipeline, decodes every change into an event plus a resumable
//! position, and dispatches to the consumer wrapped in the retry policy.
//! The whole worker body is itself retry-wrapped, so a feed failure
//! restarts from a fresh feed open after the configured delay.
//!
//! Delivery semantics are at-least-once: a transient consumer failure
//! re-delivers the same event after the delay, with no deduplication.
//! Ordering is guaranteed within a subscription (feed order), not across
//! subscriptions.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio_stream::StreamExt as _;

use crate::{
    envelope::{EnvelopeCodec, EventEnvelope, JsonCodec},
    filter::{self, FilterSpecification, InvalidFilterSpecification},
    log::{AppendLog, ChangeRecord, FeedOptions},
    retry::{Delays, RetryStrategy, retry},
};

/// A deserialized change paired with its resumable feed position.
///
/// Persisting the position (externally) lets a consumer resume after a
/// restart via a feed-configurer hook.
#[derive(Clone, Debug)]
pub struct EventWithPosition {
    /// The decoded event envelope.
    pub event: EventEnvelope,
    /// Position of the change that carried it.
    pub position: crate::log::ResumeToken,
}

/// Failure reported by a consumer callback. Treated as transient and
/// retried under the configured strategy.
pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer callback invoked for every delivered event.
pub type EventConsumer = Arc<dyn Fn(EventWithPosition) -> Result<(), ConsumerError> + Send + Sync>;

/// Hook adjusting feed options before the cursor is opened, e.g. to supply
/// an externally persisted resume token.
pub type FeedConfigurer = Arc<dyn Fn(FeedOptions) -> FeedOptions + Send + Sync>;

/// Lifecycle state of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, worker not yet iterating a feed.
    Created,
    /// Feed open, delivering events.
    Running,
    /// Cancelled by the caller.
    Cancelled,
    /// Worker terminated on an unretried failure; the subscription must be
    /// re-created by the caller.
    Failed,
    /// Terminated by engine shutdown.
    ShuttingDown,
}

/// Error from [`SubscriptionEngine::stream`].
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Invalid subscription id or argument combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The filter specification could not be compiled.
    #[error(transparent)]
    InvalidFilter(#[from] InvalidFilterSpecification),
    /// The engine has been shut down and accepts no new subscriptions.
    #[error("subscription engine has been shut down")]
    ShutDown,
}

/// Error from [`SubscriptionHandle::wait_until_started`].
#[derive(Debug, Error)]
pub enum StartWaitError {
    /// The subscription did not reach [`SubscriptionState::Running`] within
    /// the timeout.
    #[error("subscription did not start within the timeout")]
    TimedOut,
    /// The subscription terminated before starting.
    #[error("subscription terminated before starting")]
    Terminated,
}

/// Handle to a live subscription.
///
/// Dropping the handle does not cancel the subscription; call
/// [`cancel`](Self::cancel) or
/// [`SubscriptionEngine::cancel_subscription`].
pub struct SubscriptionHandle {
    subscription_id: String,
    cancel: Arc<watch::Sender<bool>>,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    /// The subscription id this handle controls.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.subscription_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Whether the worker has opened its feed and is delivering.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == SubscriptionState::Running
    }

    /// Signal cancellation. Idempotent; the worker closes its cursor and
    /// deregisters.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait until the subscription is running, bounded by `wait`.
    ///
    /// # Errors
    ///
    /// [`StartWaitError::TimedOut`] when the bound elapses first,
    /// [`StartWaitError::Terminated`] when the subscription ends without
    /// ever running.
    pub async fn wait_until_started(&mut self, wait: Duration) -> Result<(), StartWaitError> {
        let outcome = tokio::time::timeout(
            wait,
            self.state
                .wait_for(|state| !matches!(state, SubscriptionState::Created)),
        )
        .await;
        match outcome {
            Err(_elapsed) => Err(StartWaitError::TimedOut),
            Ok(Err(_closed)) => Err(StartWaitError::Terminated),
            Ok(Ok(state)) => {
                if *state == SubscriptionState::Running {
                    Ok(())
                } else {
                    Err(StartWaitError::Terminated)
                }
            }
        }
    }
}

struct SubscriptionEntry {
    cancel: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<SubscriptionState>>,
}

struct EngineInner<L, C> {
    log: L,
    codec: C,
    retry_strategy: RetryStrategy,
    shutting_down: AtomicBool,
    registry: Mutex<HashMap<String, SubscriptionEntry>>,
}

/// Engine owning the live-subscription registry and the worker tasks.
pub struct SubscriptionEngine<L, C = JsonCodec> {
    inner: Arc<EngineInner<L, C>>,
}

impl<L, C> Clone for SubscriptionEngine<L, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L, C> SubscriptionEngine<L, C>
where
    L: AppendLog,
    C: EnvelopeCodec,
{
    /// Create an engine over the given log. The retry strategy is immutable
    /// for the engine's lifetime.
    #[must_use]
    pub fn new(log: L, codec: C, retry_strategy: RetryStrategy) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                log,
                codec,
                retry_strategy,
                shutting_down: AtomicBool::new(false),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a subscription delivering filtered events to `consumer`.
    ///
    /// One worker task is spawned per subscription; tasks run independently
    /// and concurrently with no ordering guarantee between subscriptions.
    /// Within one subscription events are delivered strictly in feed order.
    ///
    /// # Errors
    ///
    /// [`SubscriptionError::InvalidArgument`] for an empty or already
    /// registered id, [`SubscriptionError::InvalidFilter`] when the filter
    /// does not compile, [`SubscriptionError::ShutDown`] after
    /// [`shutdown`](Self::shutdown).
    pub fn stream<F>(
        &self,
        subscription_id: &str,
        consumer: F,
        filter: Option<FilterSpecification>,
        configure: Option<FeedConfigurer>,
    ) -> Result<SubscriptionHandle, SubscriptionError>
    where
        F: Fn(EventWithPosition) -> Result<(), ConsumerError> + Send + Sync + 'static,
    {
        if subscription_id.is_empty() {
            return Err(SubscriptionError::InvalidArgument(
                "subscription id must not be empty".to_string(),
            ));
        }
        let pipeline = filter::compile(filter.as_ref())?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Created);
        let state_tx = Arc::new(state_tx);

        {
            let mut registry = self
                .inner
                .registry
                .lock()
                .expect("subscription registry lock poisoned");
            // Checked under the registry lock so a concurrent shutdown
            // drain cannot miss this entry.
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(SubscriptionError::ShutDown);
            }
            if registry.contains_key(subscription_id) {
                return Err(SubscriptionError::InvalidArgument(format!(
                    "subscription `{subscription_id}` is already registered"
                )));
            }
            registry.insert(
                subscription_id.to_string(),
                SubscriptionEntry {
                    cancel: Arc::clone(&cancel_tx),
                    state: Arc::clone(&state_tx),
                },
            );
        }

        let ctx = Arc::new(WorkerCtx {
            inner: Arc::clone(&self.inner),
            subscription_id: subscription_id.to_string(),
            pipeline,
            consumer: Arc::new(consumer),
            configure,
            state: Arc::clone(&state_tx),
            cancel_marker: Arc::clone(&cancel_tx),
        });
        tokio::spawn(run_worker(ctx, cancel_rx));
        tracing::debug!(subscription_id, "subscription scheduled");

        Ok(SubscriptionHandle {
            subscription_id: subscription_id.to_string(),
            cancel: cancel_tx,
            state: state_rx,
        })
    }

    /// Cancel a subscription by id. Idempotent: cancelling an unknown id is
    /// a no-op.
    pub fn cancel_subscription(&self, subscription_id: &str) {
        let entry = self
            .inner
            .registry
            .lock()
            .expect("subscription registry lock poisoned")
            .remove(subscription_id);
        match entry {
            Some(entry) => {
                entry.cancel.send_replace(true);
                tracing::debug!(subscription_id, "subscription cancelled");
            }
            None => {
                tracing::trace!(subscription_id, "cancel for unregistered subscription ignored");
            }
        }
    }

    /// Shut the engine down: stop accepting new subscriptions, halt every
    /// worker's retry loop and cancel all registered subscriptions.
    ///
    /// The engine must not be reused afterwards; subsequent
    /// [`stream`](Self::stream) calls fail with
    /// [`SubscriptionError::ShutDown`].
    pub fn shutdown(&self) {
        // Flag first: every outer retry loop observes it before the
        // registry is drained.
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let entries: Vec<(String, SubscriptionEntry)> = {
            let mut registry = self
                .inner
                .registry
                .lock()
                .expect("subscription registry lock poisoned");
            registry.drain().collect()
        };
        for (subscription_id, entry) in entries {
            entry.cancel.send_replace(true);
            tracing::debug!(subscription_id = %subscription_id, "subscription cancelled for shutdown");
        }
    }

    /// Whether the id currently names a registered subscription.
    #[must_use]
    pub fn is_registered(&self, subscription_id: &str) -> bool {
        self.inner
            .registry
            .lock()
            .expect("subscription registry lock poisoned")
            .contains_key(subscription_id)
    }

    /// Lifecycle state of a registered subscription, `None` for unknown
    /// ids.
    #[must_use]
    pub fn subscription_state(&self, subscription_id: &str) -> Option<SubscriptionState> {
        self.inner
            .registry
            .lock()
            .expect("subscription registry lock poisoned")
            .get(subscription_id)
            .map(|entry| *entry.state.borrow())
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }
}

struct WorkerCtx<L, C> {
    inner: Arc<EngineInner<L, C>>,
    subscription_id: String,
    pipeline: Vec<Value>,
    consumer: EventConsumer,
    configure: Option<FeedConfigurer>,
    state: Arc<watch::Sender<SubscriptionState>>,
    cancel_marker: Arc<watch::Sender<bool>>,
}

async fn run_worker<L, C>(ctx: Arc<WorkerCtx<L, C>>, cancel_rx: watch::Receiver<bool>)
where
    L: AppendLog,
    C: EnvelopeCodec,
{
    let mut delays = ctx.inner.retry_strategy.delays();
    let result = retry(
        || run_feed_once(Arc::clone(&ctx), cancel_rx.clone()),
        |_error: &WorkerError<L::Error>| {
            !ctx.inner.shutting_down.load(Ordering::SeqCst) && !*cancel_rx.borrow()
        },
        &mut delays,
    )
    .await;

    let final_state = if ctx.inner.shutting_down.load(Ordering::SeqCst) {
        SubscriptionState::ShuttingDown
    } else if *cancel_rx.borrow() {
        SubscriptionState::Cancelled
    } else {
        match result {
            Ok(()) => SubscriptionState::Cancelled,
            Err(error) => {
                tracing::error!(
                    subscription_id = %ctx.subscription_id,
                    error = %error,
                    "subscription worker terminated"
                );
                SubscriptionState::Failed
            }
        }
    };
    deregister(&ctx);
    ctx.state.send_replace(final_state);
}

/// Remove the worker's own registry entry, leaving any re-registration
/// under the same id untouched.
fn deregister<L, C>(ctx: &WorkerCtx<L, C>) {
    let mut registry = ctx
        .inner
        .registry
        .lock()
        .expect("subscription registry lock poisoned");
    if let Some(entry) = registry.get(&ctx.subscription_id)
        && Arc::ptr_eq(&entry.cancel, &ctx.cancel_marker)
    {
        registry.remove(&ctx.subscription_id);
    }
}

/// One feed incarnation: open, register as running, iterate until the
/// cursor is closed or the feed fails.
async fn run_feed_once<L, C>(
    ctx: Arc<WorkerCtx<L, C>>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<(), WorkerError<L::Error>>
where
    L: AppendLog,
    C: EnvelopeCodec,
{
    if *cancel_rx.borrow() || ctx.inner.shutting_down.load(Ordering::SeqCst) {
        return Ok(());
    }

    let options = match &ctx.configure {
        Some(configure) => configure(FeedOptions::default()),
        None => FeedOptions::default(),
    };
    let mut feed = ctx
        .inner
        .log
        .watch(&ctx.pipeline, options)
        .await
        .map_err(WorkerError::Feed)?;

    ctx.state.send_replace(SubscriptionState::Running);
    tracing::debug!(subscription_id = %ctx.subscription_id, "change feed opened");

    // One delay sequence per feed incarnation, shared by every dispatch:
    // delays consumed by one delivery are not handed out again.
    let mut dispatch_delays = ctx.inner.retry_strategy.delays();

    loop {
        tokio::select! {
            biased;
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    tracing::debug!(
                        subscription_id = %ctx.subscription_id,
                        "subscription cursor closed"
                    );
                    return Ok(());
                }
            }
            change = feed.next() => {
                match change {
                    None => return Err(WorkerError::FeedClosed),
                    Some(Err(error)) => return Err(WorkerError::Feed(error)),
                    Some(Ok(change)) => {
                        let Some(delivery) = decode_change(&ctx, &change) else {
                            continue;
                        };
                        dispatch(&ctx, delivery, &mut dispatch_delays).await?;
                    }
                }
            }
        }
    }
}

/// Decode a change into a delivery, skipping documents that are not event
/// envelopes. Malformed or foreign documents in the log must not crash the
/// subscription.
fn decode_change<L, C>(ctx: &WorkerCtx<L, C>, change: &ChangeRecord) -> Option<EventWithPosition>
where
    L: AppendLog,
    C: EnvelopeCodec,
{
    match ctx.inner.codec.decode(&change.full_document) {
        Ok(event) => Some(EventWithPosition {
            event,
            position: change.resume_token.clone(),
        }),
        Err(error) => {
            tracing::warn!(
                subscription_id = %ctx.subscription_id,
                error = %error,
                "skipping change that is not an event envelope"
            );
            None
        }
    }
}

/// Dispatch one delivery, retrying any consumer failure under the engine's
/// strategy. At-least-once: a retried delivery re-invokes the consumer with
/// the same event.
async fn dispatch<L, C>(
    ctx: &WorkerCtx<L, C>,
    delivery: EventWithPosition,
    delays: &mut Option<Delays>,
) -> Result<(), WorkerError<L::Error>>
where
    L: AppendLog,
    C: EnvelopeCodec,
{
    let consumer = Arc::clone(&ctx.consumer);
    retry(
        || {
            let consumer = Arc::clone(&consumer);
            let delivery = delivery.clone();
            async move { consumer(delivery) }
        },
        |_error: &ConsumerError| true,
        delays,
    )
    .await
    .map_err(WorkerError::Consumer)
}

#[derive(Debug, Error)]
enum WorkerError<E>
where
    E: std::error::Error + 'static,
{
    #[error("change feed error: {0}")]
    Feed(#[source] E),
    #[error("change feed terminated unexpectedly")]
    FeedClosed,
    #[error("event consumer failed: {0}")]
    Consumer(ConsumerError),
}
