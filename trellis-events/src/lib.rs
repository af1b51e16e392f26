//! Event dispatching for Trellis applications.
//!
//! This crate provides an in-process event dispatcher with priority ordering,
//! `*` wildcard listeners, deferred (pushed) events, and queueable listeners.
//!
//! ## Features
//!
//! - **Priority ordering** - Higher priorities run first; registration order
//!   is preserved within a priority
//! - **Wildcards** - `user.*` listeners receive every `user.` event
//! - **Halting** - `until` returns the first non-null listener response
//! - **Short-circuit** - A listener returning `false` stops propagation
//! - **Deferral** - `push`/`flush` delay an event until explicitly replayed
//! - **Queueing** - Queueable listeners become queue jobs instead of running
//!   inline
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trellis_events::{Event, EventDispatcher, FnListener, payload, value};
//!
//! let events = EventDispatcher::new();
//!
//! events.listen(
//!     "user.created",
//!     FnListener::arc(|event: &Event| {
//!         let id = event.payload_item::<u64>(0)?;
//!         Some(value(format!("welcomed user {id}")))
//!     }),
//!     0,
//! );
//!
//! let responses = events
//!     .fire(Event::new("user.created", vec![payload(42u64)]))
//!     .await?;
//! assert_eq!(responses.len(), 1);
//! ```
//!
//! ## Halting
//!
//! ```rust,ignore
//! // First non-null response wins; remaining listeners never run.
//! if let Some(answer) = events.until("auth.check").await? {
//!     // ...
//! }
//! ```

pub mod dispatcher;
pub mod event;

pub use dispatcher::{EventDispatcher, Subscriber, parse_reference, pattern_matches};
pub use event::{
    DispatchError, Event, FnListener, JobDescriptor, Listener, ListenerResolver, ListenerValue,
    PayloadItem, Queue, QueueResolver, halt_propagation, payload, value,
};
