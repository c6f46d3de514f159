//! Correlation table and inbound routing.
//!
//! The dispatcher owns every pending call from the moment its request is
//! registered until exactly one of these happens: a matching response or
//! error arrives, the caller abandons it, it expires, or the connection is
//! lost. Events fan out to subscribers by name.

use crate::error::{ConnectionError, Error, LossReason, ProtocolError, RemoteError, Result};
use crate::protocol::{Body, Envelope, ErrorReport, Value};
use crate::transport::sequence::SequenceCounter;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace, warn};

/// Type alias for the completion side of a pending call.
type Completion = oneshot::Sender<Result<Value>>;

/// Items delivered to an event subscription.
type EventItem = Result<Vec<Value>>;

/// What to do with an error report that matches no pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsolicitedErrorPolicy {
    /// Treat it as a connection-level error and fail every pending call.
    #[default]
    FailPending,
    /// Log it and carry on.
    Ignore,
}

/// Configuration for the correlation table.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of calls awaiting an answer.
    pub max_pending: usize,
    /// Handling of error reports with an unknown `failed_message_id`.
    pub unsolicited_errors: UnsolicitedErrorPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_pending: 1024,
            unsolicited_errors: UnsolicitedErrorPolicy::FailPending,
        }
    }
}

/// What [`Dispatcher::on_envelope`] did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A pending call completed with a result.
    Resolved(u64),
    /// A pending call completed with the peer's error.
    Rejected(u64),
    /// A response or error named no pending call.
    Unmatched(u64),
    /// An unmatched error failed this many pending calls.
    Broadcast {
        /// The id the error report carried.
        failed_message_id: u64,
        /// Number of calls failed.
        failed: usize,
    },
    /// An event reached this many subscribers.
    Delivered {
        /// Event name.
        name: String,
        /// Subscribers that received it.
        subscribers: usize,
    },
    /// The envelope was dropped (inbound request, or dispatcher closed).
    Ignored,
}

struct PendingEntry {
    created_at: Instant,
    // Returned to `Inner::slots` when the entry leaves the table.
    _slot: OwnedSemaphorePermit,
    token: u64,
    completion: Completion,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<EventItem>,
}

struct Inner {
    config: DispatcherConfig,
    pending: DashMap<u64, PendingEntry>,
    slots: Arc<Semaphore>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    closed: RwLock<Option<LossReason>>,
    next_token: AtomicU64,
}

/// Routes inbound envelopes to pending calls and event subscribers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.inner.pending.len())
            .field("closed", &*self.inner.closed.read())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        let slots = Arc::new(Semaphore::new(
            config.max_pending.min(Semaphore::MAX_PERMITS),
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                pending: DashMap::new(),
                slots,
                subscribers: Mutex::new(HashMap::new()),
                closed: RwLock::new(None),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    /// Register a pending call under `id`.
    ///
    /// # Errors
    ///
    /// Fails with [`ProtocolError::IdInUse`] if `id` is still pending,
    /// [`ConnectionError::TooManyInFlight`] if the table is full and
    /// [`ConnectionError::Lost`] once the dispatcher has been cancelled.
    pub fn register_pending(&self, id: u64) -> Result<PendingCall> {
        // Held across the insert so cancel_all cannot slip in between.
        let closed = self.inner.closed.read();
        if let Some(reason) = closed.as_ref() {
            return Err(reason.clone().into());
        }

        let Ok(slot) = Arc::clone(&self.inner.slots).try_acquire_owned() else {
            return Err(ConnectionError::TooManyInFlight {
                current: self.inner.pending.len(),
                max: self.inner.config.max_pending,
            }
            .into());
        };

        match self.inner.pending.entry(id) {
            Entry::Occupied(_) => Err(ProtocolError::IdInUse(id).into()),
            Entry::Vacant(vacant) => {
                let (completion, rx) = oneshot::channel();
                let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
                vacant.insert(PendingEntry {
                    created_at: Instant::now(),
                    _slot: slot,
                    token,
                    completion,
                });
                trace!("registered pending call {}", id);

                Ok(PendingCall {
                    id,
                    token,
                    rx,
                    inner: Arc::clone(&self.inner),
                    done: false,
                })
            }
        }
    }

    /// Draw ids from `sequence` until one is free and register it.
    ///
    /// Ids that are still pending (possible after the counter wraps) are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Same as [`register_pending`](Self::register_pending), except that a
    /// busy id is retried rather than returned.
    pub fn register_next(&self, sequence: &SequenceCounter) -> Result<PendingCall> {
        let max = self.inner.config.max_pending;

        for _ in 0..=max {
            let id = sequence.next();
            match self.register_pending(id) {
                Err(Error::Protocol(ProtocolError::IdInUse(id))) => {
                    debug!("skipping correlation id {}, still pending", id);
                }
                other => return other,
            }
        }

        Err(ConnectionError::TooManyInFlight {
            current: self.pending_count(),
            max,
        }
        .into())
    }

    /// Route one inbound envelope.
    ///
    /// Never fails: unknown correlations and stray requests are logged and
    /// dropped so the read path keeps going.
    pub fn on_envelope(&self, envelope: Envelope) -> Dispatched {
        if self.is_closed() {
            debug!(
                "dropping {} envelope {} after connection loss",
                envelope.body.kind(),
                envelope.id
            );
            return Dispatched::Ignored;
        }

        match envelope.body {
            Body::Response(response) => {
                let id = response.request_id;
                if self.complete(id, Ok(response.result)) {
                    Dispatched::Resolved(id)
                } else {
                    warn!("discarding response: {}", ProtocolError::UnknownCorrelation(id));
                    Dispatched::Unmatched(id)
                }
            }
            Body::Error(report) => self.on_error_report(report),
            Body::Event(event) => {
                let subscribers = self.publish(&event.name, &event.args);
                Dispatched::Delivered {
                    name: event.name,
                    subscribers,
                }
            }
            Body::Request(request) => {
                warn!(
                    "ignoring inbound request {} for {}.{}",
                    envelope.id, envelope.service, request.method
                );
                Dispatched::Ignored
            }
        }
    }

    fn on_error_report(&self, report: ErrorReport) -> Dispatched {
        let id = report.failed_message_id;

        if let Some((_, entry)) = self.inner.pending.remove(&id) {
            debug!("call {} failed remotely with code {}", id, report.code);
            let _ = entry
                .completion
                .send(Err(remote_error(report, false).into()));
            return Dispatched::Rejected(id);
        }

        warn!(
            "{} (error report code {}: {})",
            ProtocolError::UnknownCorrelation(id),
            report.code,
            report.description
        );

        match self.inner.config.unsolicited_errors {
            UnsolicitedErrorPolicy::Ignore => Dispatched::Unmatched(id),
            UnsolicitedErrorPolicy::FailPending => {
                let remote = remote_error(report, true);
                let mut failed = 0;
                for key in self.pending_ids() {
                    if let Some((_, entry)) = self.inner.pending.remove(&key) {
                        let _ = entry.completion.send(Err(remote.clone().into()));
                        failed += 1;
                    }
                }
                if failed > 0 {
                    warn!("unsolicited error failed {} pending calls", failed);
                }
                Dispatched::Broadcast {
                    failed_message_id: id,
                    failed,
                }
            }
        }
    }

    fn complete(&self, id: u64, result: Result<Value>) -> bool {
        match self.inner.pending.remove(&id) {
            Some((_, entry)) => {
                trace!("completing call {}", id);
                // The caller may have stopped listening; nothing to do then.
                let _ = entry.completion.send(result);
                true
            }
            None => false,
        }
    }

    fn publish(&self, name: &str, args: &[Value]) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        let Some(list) = subscribers.get_mut(name) else {
            trace!("no subscribers for event {}", name);
            return 0;
        };

        list.retain(|subscriber| subscriber.tx.send(Ok(args.to_vec())).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            subscribers.remove(name);
        }
        delivered
    }

    /// Subscribe to events named `name`.
    ///
    /// If the dispatcher is already cancelled the subscription yields a
    /// single connection-lost error and ends.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        let closed = self.inner.closed.read();
        if let Some(reason) = closed.as_ref() {
            let _ = tx.send(Err(reason.clone().into()));
        } else {
            self.inner
                .subscribers
                .lock()
                .entry(name.clone())
                .or_default()
                .push(Subscriber { id, tx });
            debug!("subscribed to event {}", name);
        }

        Subscription {
            name,
            id,
            rx: UnboundedReceiverStream::new(rx),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fail every pending call and end every subscription with `reason`.
    ///
    /// The dispatcher stays closed afterwards: new registrations fail and
    /// late envelopes are ignored. Returns the number of calls cancelled.
    pub fn cancel_all(&self, reason: LossReason) -> usize {
        let mut closed = self.inner.closed.write();
        let reason = closed.get_or_insert(reason).clone();

        let mut cancelled = 0;
        for id in self.pending_ids() {
            if let Some((_, entry)) = self.inner.pending.remove(&id) {
                let _ = entry.completion.send(Err(reason.clone().into()));
                cancelled += 1;
            }
        }

        let subscribers = std::mem::take(&mut *self.inner.subscribers.lock());
        for subscriber in subscribers.into_values().flatten() {
            let _ = subscriber.tx.send(Err(reason.clone().into()));
        }

        if cancelled > 0 {
            debug!("cancelled {} pending calls: {}", cancelled, reason);
        }
        cancelled
    }

    /// Fail and remove pending calls older than `max_age`.
    ///
    /// Returns the number of calls expired.
    pub fn reap_expired(&self, max_age: Duration) -> usize {
        let expired: Vec<u64> = self
            .inner
            .pending
            .iter()
            .filter(|entry| entry.created_at.elapsed() > max_age)
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for id in expired {
            if let Some((_, entry)) = self
                .inner
                .pending
                .remove_if(&id, |_, entry| entry.created_at.elapsed() > max_age)
            {
                let _ = entry.completion.send(Err(Error::Timeout(max_age)));
                reaped += 1;
            }
        }

        if reaped > 0 {
            warn!("expired {} pending calls older than {:?}", reaped, max_age);
        }
        reaped
    }

    /// Number of calls awaiting an answer.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// True if `id` is awaiting an answer.
    #[must_use]
    pub fn is_pending(&self, id: u64) -> bool {
        self.inner.pending.contains_key(&id)
    }

    /// Number of live subscriptions for `name`.
    #[must_use]
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(name)
            .map_or(0, Vec::len)
    }

    /// True once [`cancel_all`](Self::cancel_all) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.read().is_some()
    }

    /// The reason recorded by the first [`cancel_all`](Self::cancel_all).
    #[must_use]
    pub fn loss_reason(&self) -> Option<LossReason> {
        self.inner.closed.read().clone()
    }

    fn pending_ids(&self) -> Vec<u64> {
        self.inner.pending.iter().map(|entry| *entry.key()).collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

fn remote_error(report: ErrorReport, unsolicited: bool) -> RemoteError {
    RemoteError {
        code: report.code,
        description: report.description,
        details: report.details,
        unsolicited,
    }
}

/// Completion handle for one in-flight call.
///
/// Resolves exactly once. Dropping it before it resolves removes the call
/// from the table, so a late answer is discarded.
pub struct PendingCall {
    id: u64,
    token: u64,
    rx: oneshot::Receiver<Result<Value>>,
    inner: Arc<Inner>,
    done: bool,
}

impl PendingCall {
    /// Correlation id of the call.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Time since the call was registered, if it is still in the table.
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.inner
            .pending
            .get(&self.id)
            .filter(|entry| entry.token == self.token)
            .map(|entry| entry.created_at.elapsed())
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result.unwrap_or(Err(Error::ChannelClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let token = self.token;
        if self
            .inner
            .pending
            .remove_if(&self.id, |_, entry| entry.token == token)
            .is_some()
        {
            debug!("abandoned call {} removed from table", self.id);
        }
    }
}

/// Stream of argument lists for one event name.
///
/// Ends when unsubscribed or dropped. After connection loss it yields a
/// single connection-lost error and then ends.
pub struct Subscription {
    name: String,
    id: u64,
    rx: UnboundedReceiverStream<EventItem>,
    inner: Arc<Inner>,
}

impl Subscription {
    /// Event name this subscription listens for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event's arguments.
    ///
    /// Returns `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<EventItem> {
        self.rx.next().await
    }

    /// Stop receiving events.
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn detach(&self) {
        let mut subscribers = self.inner.subscribers.lock();
        if let Some(list) = subscribers.get_mut(&self.name) {
            list.retain(|subscriber| subscriber.id != self.id);
            if list.is_empty() {
                subscribers.remove(&self.name);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = EventItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().rx).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
