//! Event and listener definitions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// A single payload element. Listeners downcast to recover the concrete type.
pub type PayloadItem = Arc<dyn Any + Send + Sync>;

/// A value returned by a listener. The dispatcher inspects it only to detect
/// the `false` short-circuit; everything else passes through untouched.
pub type ListenerValue = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete value as a payload element.
pub fn payload<T: Any + Send + Sync>(value: T) -> PayloadItem {
    Arc::new(value)
}

/// Wrap a concrete value as a listener return value.
pub fn value<T: Any + Send + Sync>(value: T) -> ListenerValue {
    Arc::new(value)
}

/// The distinguished value that stops propagation without contributing a
/// response. A listener returns it to break out of the firing loop.
pub fn halt_propagation() -> ListenerValue {
    Arc::new(false)
}

/// An event to be fired through the dispatcher.
///
/// # Examples
///
/// ```
/// use trellis_events::{Event, payload};
///
/// let event = Event::new("user.created", vec![payload(42u64)]);
/// assert_eq!(event.name, "user.created");
/// assert_eq!(event.payload_item::<u64>(0), Some(&42));
/// ```
#[derive(Clone)]
pub struct Event {
    /// Dotted event name, e.g. `user.created`.
    pub name: String,

    /// Opaque payload elements, in the order the firer supplied them.
    pub payload: Vec<PayloadItem>,

    /// When set, a broadcast job carrying this document is pushed to the
    /// configured queue as a side effect of firing.
    pub broadcast: Option<serde_json::Value>,
}

impl Event {
    /// Create an event with a payload.
    pub fn new(name: impl Into<String>, payload: Vec<PayloadItem>) -> Self {
        Self {
            name: name.into(),
            payload,
            broadcast: None,
        }
    }

    /// Create an event with no payload.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Mark the event for broadcasting with the given document.
    pub fn with_broadcast(mut self, data: serde_json::Value) -> Self {
        self.broadcast = Some(data);
        self
    }

    /// Downcast the payload element at `index`.
    pub fn payload_item<T: Any>(&self, index: usize) -> Option<&T> {
        self.payload.get(index)?.downcast_ref::<T>()
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        Event::named(name)
    }
}

impl From<String> for Event {
    fn from(name: String) -> Self {
        Event::named(name)
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("payload_len", &self.payload.len())
            .field("broadcast", &self.broadcast.is_some())
            .finish()
    }
}

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("listener resolution failed: {0}")]
    ListenerResolution(String),

    #[error("listener error: {0}")]
    Listener(String),

    /// A queueable listener fired with no queue resolver configured.
    #[error("queue resolver not configured")]
    QueueUnavailable,
}

/// Handles events fired through the dispatcher.
///
/// Returning `Ok(None)` contributes a null response. Returning a value that
/// downcasts to `false` stops propagation. Any other value is collected, or
/// returned immediately in halting mode.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Handle the event
    async fn handle(&self, event: &Event) -> Result<Option<ListenerValue>, DispatchError>;

    /// Queueable listeners are pushed to the queue collaborator as job
    /// descriptors instead of being invoked inline.
    fn should_queue(&self) -> bool {
        false
    }

    /// Optional queue name for queueable listeners.
    fn queue_name(&self) -> Option<&str> {
        None
    }
}

/// Adapts a synchronous closure into a [`Listener`].
///
/// # Examples
///
/// ```
/// use trellis_events::{Event, FnListener, value};
///
/// let listener = FnListener::arc(|event: &Event| Some(value(event.name.clone())));
/// ```
pub struct FnListener<F> {
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&Event) -> Option<ListenerValue> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }

    pub fn arc(f: F) -> Arc<dyn Listener> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F> Listener for FnListener<F>
where
    F: Fn(&Event) -> Option<ListenerValue> + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event) -> Result<Option<ListenerValue>, DispatchError> {
        Ok((self.f)(event))
    }
}

/// A unit of work handed to the queue collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job kind, e.g. `events.broadcast` or `events.call_queued_listener`.
    pub job: String,

    /// Job arguments as a JSON document.
    pub data: serde_json::Value,
}

/// The queue push surface. Transport is out of scope here; implementations
/// decide where descriptors go.
pub trait Queue: Send + Sync {
    fn push(&self, job: JobDescriptor);
}

/// Lazily resolves the queue used for broadcasts and queued listeners.
pub type QueueResolver = Arc<dyn Fn() -> Arc<dyn Queue> + Send + Sync>;

/// Resolves a named listener reference (`"Target#method"`) to an instance.
pub type ListenerResolver = Arc<dyn Fn(&str, &str) -> Option<Arc<dyn Listener>> + Send + Sync>;
