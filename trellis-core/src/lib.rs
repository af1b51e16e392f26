// Core library for the Trellis HTTP framework
// Routing, middleware pipeline, and the HTTP kernel

pub mod collection;
pub mod error;
pub mod group;
pub mod http;
pub mod kernel;
pub mod middleware;
pub mod pipeline;
pub mod route;
pub mod router;

// Re-export commonly used types
pub use collection::RouteCollection;
pub use error::Error;
pub use group::{GroupAttributes, GroupStack};
pub use http::{Method, Request, Response};
pub use kernel::{Bootstrapper, DefaultExceptionHandler, ExceptionHandler, Kernel, TerminateCallback};
pub use middleware::{
    Middleware, MiddlewareFactory, MiddlewareRegistry, Next, RequestIdMiddleware,
    TimeoutMiddleware,
};
pub use pipeline::Pipeline;
pub use route::{Action, Controller, ControllerRegistry, Handler, HandlerFn, Route};
pub use router::{Binder, Router};
