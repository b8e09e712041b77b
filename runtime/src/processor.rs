//! Message processor: a typed dispatch table of handler registrations.
//!
//! Every [`HandlerRegistration`] names one handler for one message type. The
//! [`Processor`] runs each of them as an independent worker task with its own
//! consumer group (`{service}.events.{handler}` or `{service}.commands.{handler}`),
//! so one slow or failing handler never holds back another.
//!
//! # Delivery lifecycle
//!
//! ```text
//! delivery ──► decode ──► handler ──► Ok ──────────────────────────► ack
//!                  │          │
//!                  │          └─ Transient ─► backoff, retry ─┐
//!                  │                                          │ exhausted
//!                  └─ undecodable ── Permanent ───────────────┴─► dead letter ─► ack
//! ```
//!
//! A delivery is acknowledged only after the handler succeeded or the message
//! was dead-lettered. If the dead-letter write fails the delivery is dropped
//! unacknowledged and the worker resubscribes, so the transport redelivers it.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut processor = Processor::new("svc-tickets", transport, dead_letters)
//!     .with_retry_policy(RetryPolicy::default());
//!
//! processor.register(HandlerRegistration::event::<BookingMade, _, _>(
//!     "ops_read_model.on_booking_made",
//!     move |event| {
//!         let projector = projector.clone();
//!         async move { projector.on_booking_made(event).await }
//!     },
//! ))?;
//!
//! let handles = processor.spawn(&shutdown_tx);
//! ```

use crate::retry::{RetryPolicy, retry_with_predicate};
use chrono::Utc;
use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tickets_core::correlation;
use tickets_core::dead_letter::{DeadLetter, DeadLetterSink};
use tickets_core::event_bus::{BusError, Delivery, MessageBus};
use tickets_core::message::{Command, Event, SerializedMessage, command_topic, event_topic};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

/// Error returned by a message handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Worth retrying: infrastructure hiccups, causal gaps, busy collaborators.
    #[error("transient: {0:#}")]
    Transient(anyhow::Error),

    /// Retrying cannot help: invalid state, malformed payload.
    #[error("permanent: {0:#}")]
    Permanent(anyhow::Error),
}

impl HandlerError {
    /// Wraps an error that should be retried.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::Transient(error.into())
    }

    /// Wraps an error that should go straight to the dead-letter queue.
    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(error.into())
    }

    /// Whether the processor should retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<BusError> for HandlerError {
    fn from(error: BusError) -> Self {
        Self::transient(error)
    }
}

/// Errors building a processor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Two registrations share a handler name, and so a consumer group.
    #[error("Handler '{0}' is already registered")]
    DuplicateHandler(String),
}

/// Which family of messages a handler consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    /// Event handler
    Event,
    /// Command handler
    Command,
}

impl HandlerKind {
    const fn segment(self) -> &'static str {
        match self {
            Self::Event => "events",
            Self::Command => "commands",
        }
    }
}

type BoxedHandler =
    Arc<dyn Fn(SerializedMessage) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// One entry of the dispatch table.
#[derive(Clone)]
pub struct HandlerRegistration {
    name: String,
    kind: HandlerKind,
    topic: String,
    message_name: Option<&'static str>,
    handler: BoxedHandler,
}

impl HandlerRegistration {
    /// Registers `handler` for event type `E`.
    pub fn event<E, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        E: Event,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: HandlerKind::Event,
            topic: event_topic::<E>(),
            message_name: Some(E::NAME),
            handler: typed(handler),
        }
    }

    /// Registers `handler` for command type `C`.
    pub fn command<C, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: HandlerKind::Command,
            topic: command_topic::<C>(),
            message_name: Some(C::NAME),
            handler: typed(handler),
        }
    }

    /// Registers an event handler that receives the raw envelope from `topic`.
    pub fn raw<F, Fut>(name: impl Into<String>, topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(SerializedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self {
            name: name.into(),
            kind: HandlerKind::Event,
            topic: topic.into(),
            message_name: None,
            handler: Arc::new(move |message| {
                let handler = Arc::clone(&handler);
                Box::pin(async move { handler(message).await })
            }),
        }
    }

    /// Handler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topic the handler consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group of this handler within `service`.
    #[must_use]
    pub fn consumer_group(&self, service: &str) -> String {
        format!("{service}.{}.{}", self.kind.segment(), self.name)
    }

    /// Invokes the handler once, without retries.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler returns.
    pub async fn call(&self, message: SerializedMessage) -> Result<(), HandlerError> {
        (self.handler)(message).await
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

fn typed<M, F, Fut>(handler: F) -> BoxedHandler
where
    M: tickets_core::message::Message,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |message: SerializedMessage| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let decoded = message.decode::<M>().map_err(HandlerError::permanent)?;
            handler(decoded).await
        })
    })
}

/// Runs every registered handler as its own consumer-group worker.
pub struct Processor {
    service: String,
    transport: Arc<dyn MessageBus>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    reconnect_delay: Duration,
    registrations: Vec<HandlerRegistration>,
}

impl Processor {
    /// Creates an empty processor for `service`.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        transport: Arc<dyn MessageBus>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            service: service.into(),
            transport,
            dead_letters,
            policy: RetryPolicy::default(),
            reconnect_delay: Duration::from_secs(5),
            registrations: Vec::new(),
        }
    }

    /// Sets the retry policy applied to every handler.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets how long a worker waits before resubscribing after its stream ends.
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Adds a registration to the dispatch table.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::DuplicateHandler`] if the name is taken.
    pub fn register(
        &mut self,
        registration: HandlerRegistration,
    ) -> Result<&mut Self, ProcessorError> {
        if self.registrations.iter().any(|r| r.name == registration.name) {
            return Err(ProcessorError::DuplicateHandler(registration.name));
        }
        self.registrations.push(registration);
        Ok(self)
    }

    /// Names of all registered handlers.
    #[must_use]
    pub fn handler_names(&self) -> Vec<&str> {
        self.registrations.iter().map(HandlerRegistration::name).collect()
    }

    /// Distinct topics the processor consumes.
    #[must_use]
    pub fn topics(&self) -> HashSet<&str> {
        self.registrations.iter().map(HandlerRegistration::topic).collect()
    }

    /// Spawns one worker per registration.
    ///
    /// Workers stop once `shutdown` fires; a handler call already in progress
    /// runs to completion first.
    #[must_use]
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        info!(
            service = %self.service,
            handlers = self.registrations.len(),
            "Starting message processor"
        );

        self.registrations
            .into_iter()
            .map(|registration| {
                let worker = Worker {
                    consumer_group: registration.consumer_group(&self.service),
                    registration,
                    transport: Arc::clone(&self.transport),
                    dead_letters: Arc::clone(&self.dead_letters),
                    policy: self.policy.clone(),
                    reconnect_delay: self.reconnect_delay,
                    shutdown: shutdown.subscribe(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("service", &self.service)
            .field("policy", &self.policy)
            .field("registrations", &self.registrations)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Shutdown,
    Resubscribe,
}

struct Worker {
    registration: HandlerRegistration,
    consumer_group: String,
    transport: Arc<dyn MessageBus>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    reconnect_delay: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Worker {
    async fn run(mut self) {
        let handler = self.registration.name.clone();
        info!(handler = %handler, group = %self.consumer_group, "Handler worker started");

        loop {
            let topic = self.registration.topic.clone();

            tokio::select! {
                _ = self.shutdown.recv() => break,
                subscribed = self.transport.subscribe(&[topic.as_str()], &self.consumer_group) => {
                    match subscribed {
                        Ok(mut stream) => {
                            debug!(handler = %handler, topic = %topic, "Subscribed");
                            if self.process_stream(&mut stream).await == StreamEnd::Shutdown {
                                break;
                            }
                            warn!(handler = %handler, "Stream ended, resubscribing in {:?}", self.reconnect_delay);
                        },
                        Err(e) => {
                            error!(
                                handler = %handler,
                                error = %e,
                                "Failed to subscribe, retrying in {:?}",
                                self.reconnect_delay
                            );
                        },
                    }
                    if self.pause().await {
                        break;
                    }
                }
            }
        }

        info!(handler = %handler, "Handler worker stopped");
    }

    /// Sleeps for the reconnect delay. Returns `true` if shutdown fired.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.recv() => true,
            () = tokio::time::sleep(self.reconnect_delay) => false,
        }
    }

    async fn process_stream<S>(&mut self, stream: &mut S) -> StreamEnd
    where
        S: futures::Stream<Item = Result<Delivery, BusError>> + Unpin + Send,
    {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return StreamEnd::Shutdown,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        if !self.handle(delivery).await {
                            return StreamEnd::Resubscribe;
                        }
                    },
                    Some(Err(e)) => {
                        error!(handler = %self.registration.name, error = %e, "Error receiving message");
                    },
                    None => return StreamEnd::Resubscribe,
                },
            }
        }
    }

    /// Handles one delivery. Returns `false` if it was left unacknowledged.
    async fn handle(&self, delivery: Delivery) -> bool {
        let name = self.registration.name.clone();
        let message = delivery.message.clone();

        if let Some(expected) = self.registration.message_name {
            if message.name != expected {
                debug!(handler = %name, message = %message.name, "Skipping message of another type");
                delivery.ack();
                return true;
            }
        }

        let correlation_id = message
            .correlation_id()
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let span = tracing::info_span!(
            "handle_message",
            handler = %name,
            message = %message.name,
            message_id = ?message.message_id(),
            correlation_id = %correlation_id,
        );

        let started = Instant::now();
        let outcome = correlation::scope(
            correlation_id,
            retry_with_predicate(
                &self.policy,
                || self.registration.call(message.clone()),
                HandlerError::is_retryable,
            ),
        )
        .instrument(span)
        .await;
        metrics::histogram!(crate::metrics::MESSAGE_HANDLING_SECONDS, "handler" => name.clone())
            .record(started.elapsed().as_secs_f64());

        let exhausted = match outcome {
            Ok(()) => {
                metrics::counter!(crate::metrics::MESSAGES_PROCESSED, "handler" => name).increment(1);
                delivery.ack();
                return true;
            },
            Err(exhausted) => exhausted,
        };

        metrics::counter!(crate::metrics::MESSAGES_FAILED, "handler" => name.clone()).increment(1);
        error!(
            handler = %name,
            message = %message,
            attempts = exhausted.attempts,
            error = %exhausted.error,
            "Handler gave up, dead-lettering message"
        );

        let entry = DeadLetter {
            handler: name.clone(),
            consumer_group: self.consumer_group.clone(),
            topic: delivery.topic.clone(),
            message,
            error: exhausted.error.to_string(),
            attempts: exhausted.attempts,
            failed_at: Utc::now(),
        };

        match self.dead_letters.add(entry).await {
            Ok(()) => {
                metrics::counter!(crate::metrics::MESSAGES_DEAD_LETTERED, "handler" => name)
                    .increment(1);
                delivery.ack();
                true
            },
            Err(e) => {
                error!(handler = %name, error = %e, "Failed to dead-letter message, leaving it unacknowledged");
                false
            },
        }
    }
}
