//! Event dispatcher.
//!
//! Listeners register against exact names or `*` glob patterns, with an
//! integer priority. Firing resolves the specific listeners in descending
//! priority order (registration order within a bucket), followed by wildcard
//! matches in registration order, and invokes them until one halts
//! propagation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trellis_events::{Event, EventDispatcher, FnListener, value};
//!
//! let events = EventDispatcher::new();
//! events.listen("user.created", FnListener::arc(|e| Some(value("welcome sent"))), 0);
//! let responses = events.fire("user.created").await?;
//! ```

use crate::event::{
    DispatchError, Event, JobDescriptor, Listener, ListenerResolver, ListenerValue, QueueResolver,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Registers its own listeners against a dispatcher.
pub trait Subscriber {
    fn subscribe(&self, events: &EventDispatcher);
}

/// Glob match with `*` segments. `user.*` matches `user.created` but not
/// `order.created`; a pattern without `*` must match exactly.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut parts = pattern.split('*');
    let mut rest = value;
    if let Some(head) = parts.next() {
        if !rest.starts_with(head) {
            return false;
        }
        rest = &rest[head.len()..];
    }
    let mut pending: Option<&str> = None;
    for part in parts {
        if let Some(prev) = pending.take() {
            match rest.find(prev) {
                Some(at) => rest = &rest[at + prev.len()..],
                None => return false,
            }
        }
        pending = Some(part);
    }
    match pending {
        None => true,
        Some("") => true,
        Some(tail) => rest.ends_with(tail),
    }
}

/// Splits a `"Target#method"` reference; the method defaults to `handle`.
pub fn parse_reference(reference: &str) -> (String, String) {
    match reference.split_once('#') {
        Some((target, method)) => (target.to_string(), method.to_string()),
        None => (reference.to_string(), "handle".to_string()),
    }
}

#[derive(Clone)]
enum Registered {
    /// An in-process listener instance.
    Handler(Arc<dyn Listener>),
    /// A named reference resolved at fire time.
    Named { target: String, method: String },
    /// A deferred event replayed on flush.
    Pushed(Event),
}

enum Fired {
    Responses(Vec<Option<ListenerValue>>),
    Halted(ListenerValue),
}

struct Inner {
    listeners: RwLock<HashMap<String, BTreeMap<i32, Vec<Registered>>>>,
    wildcards: RwLock<HashMap<String, Vec<Registered>>>,
    /// Per-name flattened listener list, rebuilt lazily after mutation.
    sorted: RwLock<HashMap<String, Vec<Registered>>>,
    firing: Mutex<Vec<String>>,
    resolver: RwLock<Option<ListenerResolver>>,
    queue_resolver: RwLock<Option<QueueResolver>>,
}

/// Pops the firing stack on every exit path, including errors.
struct FiringGuard<'a> {
    firing: &'a Mutex<Vec<String>>,
}

impl<'a> FiringGuard<'a> {
    fn push(firing: &'a Mutex<Vec<String>>, name: String) -> Self {
        firing.lock().push(name);
        Self { firing }
    }
}

impl Drop for FiringGuard<'_> {
    fn drop(&mut self) {
        self.firing.lock().pop();
    }
}

/// Priority/wildcard event dispatcher.
///
/// Cloning is cheap; clones share the same listener tables.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: RwLock::new(HashMap::new()),
                wildcards: RwLock::new(HashMap::new()),
                sorted: RwLock::new(HashMap::new()),
                firing: Mutex::new(Vec::new()),
                resolver: RwLock::new(None),
                queue_resolver: RwLock::new(None),
            }),
        }
    }

    /// Install the resolver used for `"Target#method"` listener references.
    pub fn set_listener_resolver(&self, resolver: ListenerResolver) {
        *self.inner.resolver.write() = Some(resolver);
    }

    /// Install the queue used for broadcasts and queued listeners.
    pub fn set_queue_resolver(&self, resolver: QueueResolver) {
        *self.inner.queue_resolver.write() = Some(resolver);
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a listener for an event name or `*` pattern.
    pub fn listen(&self, event: &str, listener: Arc<dyn Listener>, priority: i32) {
        self.register(event, Registered::Handler(listener), priority);
    }

    /// Register one listener for several names or patterns.
    pub fn listen_many(&self, events: &[&str], listener: Arc<dyn Listener>, priority: i32) {
        for event in events {
            self.listen(event, listener.clone(), priority);
        }
    }

    /// Register a `"Target#method"` reference, resolved at fire time.
    pub fn listen_named(&self, event: &str, reference: &str, priority: i32) {
        let (target, method) = parse_reference(reference);
        self.register(event, Registered::Named { target, method }, priority);
    }

    /// Let a subscriber register its own listeners.
    pub fn subscribe(&self, subscriber: &dyn Subscriber) {
        subscriber.subscribe(self);
    }

    fn register(&self, event: &str, entry: Registered, priority: i32) {
        debug!(event = %event, priority, "registering listener");
        if event.contains('*') {
            self.inner
                .wildcards
                .write()
                .entry(event.to_string())
                .or_default()
                .push(entry);
        } else {
            self.inner
                .listeners
                .write()
                .entry(event.to_string())
                .or_default()
                .entry(priority)
                .or_default()
                .push(entry);
            self.inner.sorted.write().remove(event);
        }
    }

    /// Whether any listener is registered under this exact name or pattern.
    pub fn has_listeners(&self, event: &str) -> bool {
        self.inner.listeners.read().contains_key(event)
            || self.inner.wildcards.read().contains_key(event)
    }

    /// Remove all listeners for a name or pattern.
    pub fn forget(&self, event: &str) {
        if event.contains('*') {
            self.inner.wildcards.write().remove(event);
        } else {
            self.inner.listeners.write().remove(event);
            self.inner.sorted.write().remove(event);
        }
    }

    // ------------------------------------------------------------------
    // Deferred events
    // ------------------------------------------------------------------

    /// Defer an event until [`flush`](Self::flush) is called for its name.
    pub fn push(&self, event: Event) {
        let key = format!("{}_pushed", event.name);
        self.register(&key, Registered::Pushed(event), 0);
    }

    /// Fire all events previously pushed under this name.
    pub async fn flush(&self, event: &str) -> Result<(), DispatchError> {
        self.fire(Event::named(format!("{event}_pushed"))).await?;
        Ok(())
    }

    /// Drop all deferred events.
    pub fn forget_pushed(&self) {
        let pushed: Vec<String> = self
            .inner
            .listeners
            .read()
            .keys()
            .filter(|key| key.ends_with("_pushed"))
            .cloned()
            .collect();
        for key in pushed {
            self.forget(&key);
        }
    }

    // ------------------------------------------------------------------
    // Firing
    // ------------------------------------------------------------------

    /// The name of the event currently being fired, if any.
    pub fn firing(&self) -> Option<String> {
        self.inner.firing.lock().last().cloned()
    }

    /// Fire an event and collect every listener response, in invocation
    /// order. A listener returning the `false` value stops iteration; the
    /// `false` itself is not collected.
    pub async fn fire(
        &self,
        event: impl Into<Event>,
    ) -> Result<Vec<Option<ListenerValue>>, DispatchError> {
        match self.dispatch_event(event.into(), false).await? {
            Fired::Responses(responses) => Ok(responses),
            Fired::Halted(_) => Ok(Vec::new()),
        }
    }

    /// Fire an event and return the first non-null listener response, or
    /// `None` if every listener declined.
    pub async fn until(
        &self,
        event: impl Into<Event>,
    ) -> Result<Option<ListenerValue>, DispatchError> {
        match self.dispatch_event(event.into(), true).await? {
            Fired::Halted(value) => Ok(Some(value)),
            Fired::Responses(_) => Ok(None),
        }
    }

    /// Alias for [`until`](Self::until).
    pub async fn fire_halting(
        &self,
        event: impl Into<Event>,
    ) -> Result<Option<ListenerValue>, DispatchError> {
        self.until(event).await
    }

    // Boxed at the definition so the pushed-event replay can recurse
    // through `invoke` while the future stays Send.
    fn dispatch_event(
        &self,
        event: Event,
        halt: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Fired, DispatchError>> + Send + '_>> {
        Box::pin(async move {
            let _guard = FiringGuard::push(&self.inner.firing, event.name.clone());

            if let Some(data) = &event.broadcast {
                self.broadcast(&event.name, data);
            }

            let entries = self.listeners_for(&event.name);
            debug!(event = %event.name, listeners = entries.len(), halt, "firing event");

            let mut responses = Vec::new();
            for entry in &entries {
                let response = self.invoke(entry, &event).await?;

                // A false value stops propagation in both modes; it is never
                // collected and never becomes the halting answer.
                if let Some(value) = &response {
                    if value.downcast_ref::<bool>() == Some(&false) {
                        break;
                    }
                }

                if halt {
                    if let Some(value) = response {
                        return Ok(Fired::Halted(value));
                    }
                    continue;
                }

                responses.push(response);
            }

            Ok(Fired::Responses(responses))
        })
    }

    async fn invoke(
        &self,
        entry: &Registered,
        event: &Event,
    ) -> Result<Option<ListenerValue>, DispatchError> {
        match entry {
            Registered::Handler(listener) => listener.handle(event).await,
            Registered::Named { target, method } => {
                let listener = self.resolve_named(target, method)?;
                if listener.should_queue() {
                    self.queue_listener(target, method, listener.queue_name(), event)?;
                    return Ok(None);
                }
                listener.handle(event).await
            }
            Registered::Pushed(deferred) => {
                self.dispatch_event(deferred.clone(), false).await?;
                Ok(None)
            }
        }
    }

    /// Specific listeners in descending priority order, then wildcard matches
    /// in registration order.
    fn listeners_for(&self, name: &str) -> Vec<Registered> {
        let cached = self.inner.sorted.read().get(name).cloned();
        let mut entries = match cached {
            Some(entries) => entries,
            None => {
                let built = self.sort_listeners(name);
                self.inner
                    .sorted
                    .write()
                    .insert(name.to_string(), built.clone());
                built
            }
        };
        for (pattern, listeners) in self.inner.wildcards.read().iter() {
            if pattern_matches(pattern, name) {
                entries.extend(listeners.iter().cloned());
            }
        }
        entries
    }

    fn sort_listeners(&self, name: &str) -> Vec<Registered> {
        match self.inner.listeners.read().get(name) {
            Some(buckets) => buckets
                .iter()
                .rev()
                .flat_map(|(_, bucket)| bucket.iter().cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Queue integration
    // ------------------------------------------------------------------

    /// Whether a `"Target#method"` reference resolves to a queueable
    /// listener. Resolution failure degrades to `false`.
    pub fn listener_should_queue(&self, reference: &str) -> bool {
        let (target, method) = parse_reference(reference);
        match self.resolve_named(&target, &method) {
            Ok(listener) => listener.should_queue(),
            Err(_) => false,
        }
    }

    fn resolve_named(&self, target: &str, method: &str) -> Result<Arc<dyn Listener>, DispatchError> {
        let resolver = self.inner.resolver.read().clone();
        resolver
            .and_then(|resolve| resolve(target, method))
            .ok_or_else(|| DispatchError::ListenerResolution(format!("{target}#{method}")))
    }

    fn queue_listener(
        &self,
        target: &str,
        method: &str,
        queue: Option<&str>,
        event: &Event,
    ) -> Result<(), DispatchError> {
        let resolver = self.inner.queue_resolver.read().clone();
        let resolver = resolver.ok_or(DispatchError::QueueUnavailable)?;
        debug!(event = %event.name, target, method, "queueing listener");
        resolver().push(JobDescriptor {
            job: "events.call_queued_listener".to_string(),
            data: serde_json::json!({
                "target": target,
                "method": method,
                "event": event.name,
                "queue": queue,
            }),
        });
        Ok(())
    }

    fn broadcast(&self, name: &str, data: &serde_json::Value) {
        let resolver = self.inner.queue_resolver.read().clone();
        match resolver {
            Some(resolver) => {
                debug!(event = %name, "broadcasting event");
                resolver().push(JobDescriptor {
                    job: "events.broadcast".to_string(),
                    data: serde_json::json!({ "event": name, "payload": data }),
                });
            }
            None => warn!(event = %name, "broadcast skipped, no queue resolver"),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
