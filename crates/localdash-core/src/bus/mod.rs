//! Notification bus
//!
//! Delivers state-change events synchronously to callbacks registered in the
//! same execution context, and publishes them on a shared [`BroadcastHub`]
//! so other contexts (other windows, tasks or embedded views of the same
//! data) can observe them. Each [`NotificationBus`] handle family is one
//! context; contexts sharing a hub see each other's events once their
//! remote listener is started.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::{Token, TokenId};
use crate::util::now_millis;

/// Default number of undelivered envelopes a slow context may fall behind by
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Names of the events carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "token.created")]
    TokenCreated,
    #[serde(rename = "token.updated")]
    TokenUpdated,
    #[serde(rename = "token.deleted")]
    TokenDeleted,
    #[serde(rename = "tokens.cleared")]
    TokensCleared,
    #[serde(rename = "login.changed")]
    LoginChanged,
}

impl EventKind {
    pub const ALL: [Self; 5] = [
        Self::TokenCreated,
        Self::TokenUpdated,
        Self::TokenDeleted,
        Self::TokensCleared,
        Self::LoginChanged,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TokenCreated => "token.created",
            Self::TokenUpdated => "token.updated",
            Self::TokenDeleted => "token.deleted",
            Self::TokensCleared => "tokens.cleared",
            Self::LoginChanged => "login.changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event {s:?}"))
    }
}

/// A state change worth telling subscribers about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum Event {
    #[serde(rename = "token.created")]
    TokenCreated(Token),
    #[serde(rename = "token.updated")]
    TokenUpdated(Token),
    #[serde(rename = "token.deleted")]
    TokenDeleted { id: TokenId, token: Token },
    #[serde(rename = "tokens.cleared")]
    TokensCleared {},
    /// Produced by the auth collaborator; `user` is `None` after logout
    #[serde(rename = "login.changed")]
    LoginChanged { user: Option<String>, timestamp: i64 },
}

impl Event {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::TokenCreated(_) => EventKind::TokenCreated,
            Self::TokenUpdated(_) => EventKind::TokenUpdated,
            Self::TokenDeleted { .. } => EventKind::TokenDeleted,
            Self::TokensCleared {} => EventKind::TokensCleared,
            Self::LoginChanged { .. } => EventKind::LoginChanged,
        }
    }

    pub fn login_changed(user: Option<String>) -> Self {
        Self::LoginChanged {
            user,
            timestamp: now_millis(),
        }
    }
}

/// Identity of one execution context on a hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event in transit between contexts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub origin: ContextId,
    /// Unix ms
    pub sent_at: i64,
    pub event: Event,
}

/// Shared channel connecting the contexts of one data origin
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    sender: broadcast::Sender<Envelope>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Raw envelope stream, for collaborators that want every message
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Number of contexts currently listening
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

/// Outcome of a single `emit`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Local callbacks that completed
    pub local: usize,
    /// Local callbacks that panicked
    pub failed: usize,
    /// Other contexts the envelope was handed to
    pub remote: usize,
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

struct BusInner {
    context: ContextId,
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    next_subscriber: AtomicU64,
    hub: Option<BroadcastHub>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
    /// Run every callback for the event's kind, isolating panics
    fn deliver_local(&self, event: &Event) -> (usize, usize) {
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .map(|subscribers| {
                subscribers
                    .iter()
                    .map(|subscriber| Arc::clone(&subscriber.callback))
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        let mut failed = 0;
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_ok() {
                delivered += 1;
            } else {
                failed += 1;
                tracing::error!("Listener for {} panicked; continuing delivery", event.kind());
            }
        }
        (delivered, failed)
    }

    fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Publish/subscribe handle for one execution context. Clones share
/// subscribers and the context identity.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    /// A bus that only delivers within this context
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A bus that also publishes to, and can listen on, `hub`
    pub fn connected(hub: &BroadcastHub) -> Self {
        Self::build(Some(hub.clone()))
    }

    fn build(hub: Option<BroadcastHub>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                context: ContextId::new(),
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                hub,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    /// Register `callback` for `kind`; keep the [`Subscription`] to unsubscribe
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });

        Subscription {
            id,
            kind,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of local callbacks registered for `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver locally, then publish to the hub
    pub fn emit(&self, event: Event) -> Delivery {
        let (local, failed) = self.inner.deliver_local(&event);

        let remote = self.inner.hub.as_ref().map_or(0, |hub| {
            let kind = event.kind();
            let envelope = Envelope {
                id: Uuid::now_v7(),
                origin: self.inner.context,
                sent_at: now_millis(),
                event,
            };
            match hub.sender.send(envelope) {
                // Our own listener also receives the envelope and skips it
                Ok(receivers) if self.inner.is_listening() => receivers.saturating_sub(1),
                Ok(receivers) => receivers,
                Err(_) => {
                    tracing::debug!("No contexts listening for {kind}");
                    0
                }
            }
        });

        Delivery {
            local,
            failed,
            remote,
        }
    }

    /// Start re-delivering other contexts' events to local subscribers.
    ///
    /// Idempotent: returns `false` when a listener is already running, the bus
    /// has no hub, or no async runtime is available.
    pub fn start_remote_listener(&self) -> bool {
        let Some(hub) = &self.inner.hub else {
            tracing::debug!("Bus {} has no hub; remote listener not started", self.inner.context);
            return false;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime; remote listener not started");
            return false;
        };

        let mut listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let mut receiver = hub.sender.subscribe();
        let bus = Arc::downgrade(&self.inner);
        let origin = self.inner.context;

        *listener = Some(runtime.spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) if envelope.origin == origin => {}
                    Ok(envelope) => {
                        let Some(inner) = bus.upgrade() else { break };
                        inner.deliver_local(&envelope.event);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Context {origin} fell behind and missed {missed} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        tracing::debug!("Remote listener started for context {origin}");
        true
    }

    /// Stop the remote listener; returns whether one was running
    pub fn stop_remote_listener(&self) -> bool {
        let handle = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        handle.is_some_and(|handle| {
            let running = !handle.is_finished();
            handle.abort();
            running
        })
    }

    pub fn is_listening(&self) -> bool {
        self.inner.is_listening()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("context", &self.inner.context)
            .field("connected", &self.inner.hub.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`NotificationBus::on`]
#[derive(Debug)]
#[must_use = "dropping a Subscription keeps the callback registered; call unsubscribe to remove it"]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the callback; `false` if it was already gone
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut subscribers = bus
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subscribers.get_mut(&self.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|subscriber| subscriber.id != self.id);
        list.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewToken;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn token() -> Token {
        NewToken::new("infinity_tokens", 10, "repo", "test")
            .into_token()
            .unwrap()
    }

    fn counter(bus: &NotificationBus, kind: EventKind) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let subscription = bus.on(kind, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, subscription)
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn emit_reaches_matching_subscribers_only() {
        let bus = NotificationBus::new();
        let (created, _a) = counter(&bus, EventKind::TokenCreated);
        let (cleared, _b) = counter(&bus, EventKind::TokensCleared);

        let delivery = bus.emit(Event::TokenCreated(token()));
        assert_eq!(delivery.local, 1);
        assert_eq!(delivery.remote, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cleared.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = NotificationBus::new();
        let _bad = bus.on(EventKind::TokensCleared, |_| panic!("listener failure"));
        let (count, _good) = counter(&bus, EventKind::TokensCleared);

        let delivery = bus.emit(Event::TokensCleared {});
        assert_eq!(delivery.failed, 1);
        assert_eq!(delivery.local, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = NotificationBus::new();
        let (count, subscription) = counter(&bus, EventKind::TokenCreated);

        assert!(subscription.unsubscribe());
        assert_eq!(bus.subscriber_count(EventKind::TokenCreated), 0);
        bus.emit(Event::TokenCreated(token()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn event_wire_names() {
        let value = serde_json::to_value(Event::TokensCleared {}).unwrap();
        assert_eq!(value["event"], "tokens.cleared");
        assert_eq!(value["payload"], serde_json::json!({}));

        let login = serde_json::to_value(Event::login_changed(None)).unwrap();
        assert_eq!(login["event"], "login.changed");
        assert!(login["payload"]["user"].is_null());

        assert_eq!("token.deleted".parse::<EventKind>(), Ok(EventKind::TokenDeleted));
        assert!("token.exploded".parse::<EventKind>().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_contexts_receive_events() {
        let hub = BroadcastHub::default();
        let tab_a = NotificationBus::connected(&hub);
        let tab_b = NotificationBus::connected(&hub);
        let (count, _subscription) = counter(&tab_b, EventKind::TokenCreated);

        assert!(tab_b.start_remote_listener());
        let delivery = tab_a.emit(Event::TokenCreated(token()));
        assert_eq!(delivery.remote, 1);

        wait_for(&count, 1).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn own_events_are_not_delivered_twice() {
        let hub = BroadcastHub::default();
        let bus = NotificationBus::connected(&hub);
        let (count, _subscription) = counter(&bus, EventKind::TokenCreated);

        assert!(bus.start_remote_listener());
        assert!(!bus.start_remote_listener());
        assert_eq!(hub.listener_count(), 1);

        let delivery = bus.emit(Event::TokenCreated(token()));
        assert_eq!(delivery.remote, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_and_restart_listener() {
        let hub = BroadcastHub::default();
        let bus = NotificationBus::connected(&hub);

        assert!(bus.start_remote_listener());
        assert!(bus.stop_remote_listener());
        assert!(!bus.stop_remote_listener());
        assert!(bus.start_remote_listener());
    }

    #[test]
    fn local_bus_cannot_listen_remotely() {
        assert!(!NotificationBus::new().start_remote_listener());
    }
}
