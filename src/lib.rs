// Trellis - A Laravel-inspired routing and dispatch framework for Rust
//
// This library ties the routing core and the event dispatcher together:
// register routes (grouped, named, constrained), hang listeners and filters
// off the shared dispatcher, and hand requests to the kernel.

// Re-export core functionality
pub use trellis_core::*;

// Re-export the event dispatcher
pub use trellis_events::{
    DispatchError, Event, EventDispatcher, FnListener, JobDescriptor, Listener,
    ListenerResolver, ListenerValue, PayloadItem, Queue, QueueResolver, Subscriber,
    halt_propagation, payload, value,
};

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Action,
        Controller,
        Error,
        Event,
        EventDispatcher,
        FnListener,
        GroupAttributes,
        Kernel,
        Listener,
        Method,
        Middleware,
        Next,
        Pipeline,
        Request,
        Response,
        Route,
        Router,
        halt_propagation,
        payload,
        value,
    };
}
