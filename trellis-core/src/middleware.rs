// Middleware: the trait, the shorthand registry, and built-ins

use crate::{Error, Request, Response};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Type alias for the next stage in a pipeline
pub type Next =
    Box<dyn FnOnce(Request) -> Pin<Box<dyn Future<Output = Result<Response, Error>> + Send>> + Send>;

/// Middleware trait for processing requests around the route handler
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request, optionally passing it to the next stage. Not
    /// calling `next` short-circuits the pipeline.
    async fn handle(&self, request: Request, next: Next) -> Result<Response, Error>;

    /// Called after the response has been sent, for work that should not
    /// delay it. No-op by default.
    async fn terminate(&self, _request: &Request, _response: &Response) {}
}

/// Builds a middleware instance from the parsed `:arg1,arg2` parameters.
pub type MiddlewareFactory = Arc<dyn Fn(&[String]) -> Arc<dyn Middleware> + Send + Sync>;

/// Split `"name:arg1,arg2"` into the name and its parameters.
pub fn parse_shorthand(shorthand: &str) -> (&str, Vec<String>) {
    match shorthand.split_once(':') {
        Some((name, params)) => (
            name,
            params.split(',').map(|p| p.trim().to_string()).collect(),
        ),
        None => (shorthand, Vec::new()),
    }
}

/// Name-to-middleware map used to resolve shorthand references on routes and
/// the kernel's global list.
#[derive(Default)]
pub struct MiddlewareRegistry {
    factories: RwLock<HashMap<String, MiddlewareFactory>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fixed instance under a shorthand name. Parameters in the
    /// shorthand are ignored for instance registrations.
    pub fn register(&self, name: impl Into<String>, middleware: Arc<dyn Middleware>) {
        self.register_factory(name, Arc::new(move |_params| middleware.clone()));
    }

    /// Register a factory invoked with the parsed shorthand parameters.
    pub fn register_factory(&self, name: impl Into<String>, factory: MiddlewareFactory) {
        self.factories.write().insert(name.into(), factory);
    }

    /// Resolve `"name"` or `"name:arg1,arg2"` to an instance.
    pub fn resolve(&self, shorthand: &str) -> Option<Arc<dyn Middleware>> {
        let (name, params) = parse_shorthand(shorthand);
        let factory = self.factories.read().get(name).cloned()?;
        Some(factory(&params))
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

// ========== Built-in Middleware ==========

/// Bounds handler execution time; expiry becomes a 504.
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(&self, request: Request, next: Next) -> Result<Response, Error> {
        let path = request.path.clone();
        match tokio::time::timeout(self.timeout, next(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{path} exceeded {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Request ID middleware
pub struct RequestIdMiddleware;

#[async_trait]
impl Middleware for RequestIdMiddleware {
    async fn handle(&self, mut request: Request, next: Next) -> Result<Response, Error> {
        // Generate or use existing request ID
        let request_id = request
            .headers
            .get("x-request-id")
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        request
            .headers
            .insert("x-request-id".to_string(), request_id.clone());

        let mut response = next(request).await?;
        response
            .headers
            .insert("x-request-id".to_string(), request_id);

        Ok(response)
    }
}
