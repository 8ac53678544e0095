//! Request/response correlation over a session
//!
//! An interaction produces a synchronous handler list, and the server may
//! also push the interesting handlers (a `FormToShow`, a data refresh) as
//! asynchronous events on the session's broadcast stream. The correlator
//! subscribes to that stream *before* sending, then races the two paths:
//! whichever produces a batch matching the caller's predicate first wins and
//! the losing wait is cancelled silently.

use super::changes::ChangeKind;
use super::decompress::Decompressor;
use super::error::{
    ConnectionError, EngineError, ErrorAddress, ProtocolError, Result, TransportError,
};
use super::wire::{Handler, Interaction, decode_handlers};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A live connection to the remote UI server.
///
/// Implementations own the socket; the engine only sends interactions and
/// listens to the event stream.
#[async_trait]
pub trait Session: Send + Sync {
    /// Session identifier
    fn id(&self) -> &str;

    /// Send one interaction and return the raw synchronous response
    async fn invoke(&self, interaction: &Interaction) -> std::result::Result<Value, TransportError>;

    /// Subscribe to asynchronously pushed payloads
    fn events(&self) -> broadcast::Receiver<Value>;

    /// Server form currently showing `page_id`, if the page is open
    fn open_form_id(&self, page_id: &str) -> Option<String>;

    /// Whether `page_id` is open on this session
    fn is_page_open(&self, page_id: &str) -> bool {
        self.open_form_id(page_id).is_some()
    }

    /// Every form id currently open on this session
    fn open_form_ids(&self) -> Vec<String>;
}

/// Lookup of live sessions by id
pub trait SessionDirectory: Send + Sync {
    /// Live session with this id
    fn session(&self, session_id: &str) -> Option<Arc<dyn Session>>;
}

/// In-process session directory
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
}

impl SessionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its own id, replacing any previous one
    pub fn register(&self, session: Arc<dyn Session>) {
        let id = session.id().to_string();
        self.sessions.write().insert(id, session);
    }

    /// Forget a session
    pub fn remove(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        self.sessions.write().remove(session_id)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl SessionDirectory for SessionRegistry {
    fn session(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        self.sessions.read().get(session_id).cloned()
    }
}

type PredicateFn = dyn Fn(&[Handler]) -> bool + Send + Sync;

/// Test applied to each decoded batch
#[derive(Clone)]
pub struct HandlerPredicate {
    name: Arc<str>,
    test: Arc<PredicateFn>,
}

impl fmt::Debug for HandlerPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerPredicate")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl HandlerPredicate {
    /// Predicate from a closure; `name` shows up in timeout errors and logs
    pub fn new(
        name: impl Into<String>,
        test: impl Fn(&[Handler]) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            test: Arc::new(test),
        }
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate against a batch
    pub fn matches(&self, handlers: &[Handler]) -> bool {
        (self.test)(handlers)
    }

    /// Any `FormToShow` event
    pub fn form_shown() -> Self {
        Self::new("FormToShow", |handlers| {
            handlers.iter().any(|h| h.shown_form().is_some())
        })
    }

    /// Any change handler for `form_id`
    pub fn changes_for(form_id: impl Into<String>) -> Self {
        let form_id = form_id.into();
        Self::new(format!("changes for form {form_id}"), move |handlers| {
            handlers
                .iter()
                .filter_map(Handler::as_changes)
                .any(|set| set.form_id == form_id && !set.changes.is_empty())
        })
    }

    /// Also match batches carrying an error, validation or confirmation
    /// message, so a rejected interaction does not sit out the full wait
    pub fn or_remote_message(self) -> Self {
        let name = format!("{} or remote message", self.name);
        Self::new(name, move |handlers| {
            self.matches(handlers) || handlers.iter().any(|h| h.as_message().is_some())
        })
    }

    /// A data refresh for `form_id`
    pub fn data_refresh(form_id: impl Into<String>) -> Self {
        let form_id = form_id.into();
        Self::new(format!("data refresh for form {form_id}"), move |handlers| {
            handlers
                .iter()
                .any(|h| h.has_change(&form_id, ChangeKind::DataRefresh))
        })
    }
}

/// Whether a wait is essential to the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Timing out is an ordinary outcome
    Optional,
    /// Timing out fails the operation with a retryable error
    Required,
}

/// How long and how hard to wait for asynchronous handlers
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Upper bound on the wait
    pub timeout: Duration,
    /// External cancellation
    pub cancel: CancellationToken,
    /// What a timeout means
    pub requirement: Requirement,
}

impl WaitOptions {
    /// Wait whose timeout is acceptable
    pub fn optional(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
            requirement: Requirement::Optional,
        }
    }

    /// Wait whose timeout fails the operation
    pub fn required(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
            requirement: Requirement::Required,
        }
    }

    /// Tie the wait to an external cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// How a handler wait ended
#[derive(Debug)]
pub enum WaitOutcome {
    /// A batch satisfied the predicate
    Matched(Vec<Handler>),
    /// The deadline passed
    TimedOut,
    /// The wait was cancelled; never an error
    Cancelled,
    /// The event stream closed
    Closed,
}

/// A registered wait on the session's event stream.
///
/// The subscription exists from construction, so events pushed while the
/// triggering interaction is still in flight are not missed.
pub struct HandlerWait {
    receiver: broadcast::Receiver<Value>,
    predicate: HandlerPredicate,
    cancel: CancellationToken,
    deadline: Instant,
    decompressor: Decompressor,
    session_id: String,
}

impl HandlerWait {
    /// Token that cancels this wait
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drive the wait to completion
    pub async fn wait(mut self) -> WaitOutcome {
        let sleep = tokio::time::sleep_until(self.deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::trace!(
                        session = %self.session_id,
                        waiting_for = self.predicate.name(),
                        "handler wait cancelled"
                    );
                    return WaitOutcome::Cancelled;
                }
                _ = &mut sleep => return WaitOutcome::TimedOut,
                received = self.receiver.recv() => match received {
                    Ok(raw) => {
                        if let Some(batch) = self.accept(raw) {
                            return WaitOutcome::Matched(batch);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            session = %self.session_id,
                            skipped,
                            "event receiver lagged; some pushed handlers were dropped"
                        );
                    }
                    Err(RecvError::Closed) => return WaitOutcome::Closed,
                },
            }
        }
    }

    fn accept(&self, raw: Value) -> Option<Vec<Handler>> {
        let decoded = self
            .decompressor
            .apply(raw)
            .map_err(|err| err.to_string())
            .and_then(|payload| decode_handlers(payload).map_err(|err| err.to_string()));
        match decoded {
            Ok(batch) if self.predicate.matches(&batch) => Some(batch),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(
                    session = %self.session_id,
                    error = %err,
                    "ignoring undecodable pushed payload"
                );
                None
            }
        }
    }
}

/// Which path produced the matching batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    /// The synchronous response
    Sync,
    /// A pushed event
    Async,
}

/// Result of an interaction raced against a handler wait
#[derive(Debug, Default)]
pub struct Correlated {
    /// Decoded synchronous response
    pub sync: Vec<Handler>,
    /// Matching pushed batch, when the asynchronous path won
    pub async_batch: Option<Vec<Handler>>,
    /// Which path matched, if any did
    pub source: Option<MatchSource>,
    /// Whether an optional wait ran out
    pub timed_out: bool,
}

impl Correlated {
    /// The batch that satisfied the predicate
    pub fn matched(&self) -> Option<&[Handler]> {
        match self.source? {
            MatchSource::Sync => Some(&self.sync),
            MatchSource::Async => self.async_batch.as_deref(),
        }
    }

    /// Every handler observed, synchronous ones first
    pub fn all_handlers(&self) -> impl Iterator<Item = &Handler> {
        self.sync.iter().chain(self.async_batch.iter().flatten())
    }

    /// Owned copy of every handler observed
    pub fn into_handlers(self) -> Vec<Handler> {
        let mut all = self.sync;
        all.extend(self.async_batch.unwrap_or_default());
        all
    }
}

enum FirstOutcome {
    Invoked(Result<Vec<Handler>>),
    Waited(WaitOutcome),
}

/// Sends interactions on one session and correlates their responses
#[derive(Clone)]
pub struct Correlator {
    session: Arc<dyn Session>,
    decompressor: Decompressor,
}

impl Correlator {
    /// Correlator over `session`
    pub fn new(session: Arc<dyn Session>, decompressor: Decompressor) -> Self {
        Self {
            session,
            decompressor,
        }
    }

    /// Session identifier
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// The underlying session
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Decompress and decode a raw payload
    pub fn decode(&self, raw: Value, address: &ErrorAddress) -> Result<Vec<Handler>> {
        let payload = self.decompressor.apply(raw).map_err(|err| ProtocolError::Decode {
            detail: err.to_string(),
            address: address.clone(),
        })?;
        decode_handlers(payload).map_err(|err| {
            ProtocolError::Decode {
                detail: err.to_string(),
                address: address.clone(),
            }
            .into()
        })
    }

    /// Send one interaction and decode its synchronous response
    pub async fn invoke(&self, interaction: &Interaction) -> Result<Vec<Handler>> {
        let address = interaction_address(interaction);
        tracing::debug!(
            session = %self.session.id(),
            interaction = interaction.name(),
            form_id = interaction.form_id().unwrap_or(""),
            control_path = interaction.control_path().unwrap_or(""),
            "invoking"
        );
        let raw = self.session.invoke(interaction).await.map_err(|source| {
            EngineError::from(ConnectionError::Transport {
                session_id: self.session.id().to_string(),
                interaction: interaction.name().to_string(),
                source,
                address: address.clone(),
            })
        })?;
        self.decode(raw, &address)
    }

    /// Register a wait on the event stream; the subscription starts now
    pub fn wait_for_handlers(&self, predicate: HandlerPredicate, options: &WaitOptions) -> HandlerWait {
        HandlerWait {
            receiver: self.session.events(),
            predicate,
            cancel: options.cancel.clone(),
            deadline: Instant::now() + options.timeout,
            decompressor: self.decompressor,
            session_id: self.session.id().to_string(),
        }
    }

    /// Send `interaction` while waiting for a batch matching `predicate`.
    ///
    /// The synchronous response is always collected. When it already
    /// satisfies the predicate the pending wait is cancelled without error.
    /// A transport failure cancels the wait and propagates immediately.
    pub async fn invoke_and_wait(
        &self,
        interaction: &Interaction,
        predicate: HandlerPredicate,
        options: WaitOptions,
    ) -> Result<Correlated> {
        let cancel = options.cancel.child_token();
        let wait = self.wait_for_handlers(
            predicate.clone(),
            &WaitOptions {
                cancel: cancel.clone(),
                ..options.clone()
            },
        );

        let waiter = wait.wait();
        let invoke = self.invoke(interaction);
        tokio::pin!(waiter);
        tokio::pin!(invoke);

        let first = tokio::select! {
            result = &mut invoke => FirstOutcome::Invoked(result),
            outcome = &mut waiter => FirstOutcome::Waited(outcome),
        };

        let (sync, early) = match first {
            FirstOutcome::Invoked(result) => (result, None),
            FirstOutcome::Waited(outcome) => (invoke.await, Some(outcome)),
        };

        let sync = match sync {
            Ok(sync) => sync,
            Err(err) => {
                cancel.cancel();
                return Err(err);
            }
        };

        if let Some(WaitOutcome::Matched(batch)) = early {
            return Ok(Correlated {
                sync,
                async_batch: Some(batch),
                source: Some(MatchSource::Async),
                timed_out: false,
            });
        }

        if predicate.matches(&sync) {
            cancel.cancel();
            if early.is_none() {
                // resolves immediately as Cancelled
                let _ = waiter.await;
            }
            return Ok(Correlated {
                sync,
                async_batch: None,
                source: Some(MatchSource::Sync),
                timed_out: false,
            });
        }

        let outcome = match early {
            Some(outcome) => outcome,
            None => waiter.await,
        };
        self.settle(interaction, &predicate, &options, sync, outcome)
    }

    fn settle(
        &self,
        interaction: &Interaction,
        predicate: &HandlerPredicate,
        options: &WaitOptions,
        sync: Vec<Handler>,
        outcome: WaitOutcome,
    ) -> Result<Correlated> {
        let required = options.requirement == Requirement::Required;
        match outcome {
            WaitOutcome::Matched(batch) => Ok(Correlated {
                sync,
                async_batch: Some(batch),
                source: Some(MatchSource::Async),
                timed_out: false,
            }),
            WaitOutcome::TimedOut if required => Err(ProtocolError::Timeout {
                waiting_for: predicate.name().to_string(),
                timeout_ms: options.timeout_ms(),
                address: interaction_address(interaction),
            }
            .into()),
            WaitOutcome::Closed if required => Err(ConnectionError::EventStreamClosed {
                session_id: self.session.id().to_string(),
                address: interaction_address(interaction),
            }
            .into()),
            WaitOutcome::TimedOut | WaitOutcome::Closed => {
                tracing::debug!(
                    session = %self.session.id(),
                    interaction = interaction.name(),
                    waiting_for = predicate.name(),
                    "optional wait ended without a match"
                );
                Ok(Correlated {
                    sync,
                    async_batch: None,
                    source: None,
                    timed_out: true,
                })
            }
            WaitOutcome::Cancelled if required => Err(ProtocolError::Cancelled {
                waiting_for: predicate.name().to_string(),
                address: interaction_address(interaction),
            }
            .into()),
            WaitOutcome::Cancelled => Ok(Correlated {
                sync,
                async_batch: None,
                source: None,
                timed_out: false,
            }),
        }
    }
}

/// Fail when a batch carries an error, validation or confirmation message
pub fn ensure_no_remote_errors<'a>(
    handlers: impl IntoIterator<Item = &'a Handler>,
    address: &ErrorAddress,
) -> Result<()> {
    let Some(message) = handlers.into_iter().find_map(Handler::as_message) else {
        return Ok(());
    };
    let mut address = address.clone();
    if let Some(path) = &message.control_path {
        address = address.with_control(path.clone());
    }
    Err(ProtocolError::Remote {
        kind: message.kind,
        message: message.message.clone(),
        address,
    }
    .into())
}

fn interaction_address(interaction: &Interaction) -> ErrorAddress {
    let mut address = ErrorAddress::default();
    if let Some(form_id) = interaction.form_id() {
        address = address.with_form(form_id);
    }
    if let Some(path) = interaction.control_path() {
        address = address.with_control(path);
    }
    address
}
