// Kernel: bootstrap, global middleware, exception rendering, termination

use crate::http::{Method, Request, Response};
use crate::middleware::Middleware;
use crate::pipeline::Pipeline;
use crate::route::HandlerFn;
use crate::router::Router;
use crate::Error;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};
use trellis_events::{Event, EventDispatcher, payload};

/// One-time setup run before the first request is handled.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    async fn bootstrap(&self) -> Result<(), Error>;
}

/// Reports and renders dispatch errors.
pub trait ExceptionHandler: Send + Sync {
    fn report(&self, error: &Error);
    fn render(&self, error: &Error) -> Response;
}

/// Logs server errors, renders every error as a JSON body with the error's
/// status code. 405s carry an Allow header.
pub struct DefaultExceptionHandler;

impl ExceptionHandler for DefaultExceptionHandler {
    fn report(&self, error: &Error) {
        if error.is_server_error() {
            error!(%error, "request failed");
        } else {
            debug!(%error, "request rejected");
        }
    }

    fn render(&self, error: &Error) -> Response {
        let body = serde_json::json!({ "error": error.to_string() });
        let mut response = Response::new(error.status_code())
            .with_header("Content-Type", "application/json")
            .with_body(body.to_string().into_bytes());
        if let Some(allowed) = error.allowed_methods() {
            let allow = allowed
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(",");
            response = response.with_header("Allow", allow);
        }
        response
    }
}

/// Runs after the response has gone out.
pub type TerminateCallback = Box<dyn Fn(&Request, &Response) + Send + Sync>;

/// The HTTP kernel. Owns the global middleware list, bootstraps once before
/// the first request, sends every request through the global pipeline into
/// the router, and turns errors into responses instead of surfacing them.
pub struct Kernel {
    router: Arc<Router>,
    events: EventDispatcher,
    middleware: RwLock<Vec<String>>,
    bootstrappers: Mutex<Vec<Arc<dyn Bootstrapper>>>,
    bootstrapped: AtomicBool,
    bootstrap_lock: tokio::sync::Mutex<()>,
    exception_handler: RwLock<Arc<dyn ExceptionHandler>>,
    terminators: Mutex<Vec<TerminateCallback>>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::from_router(Arc::new(Router::new()))
    }

    pub fn from_router(router: Arc<Router>) -> Self {
        let events = router.events().clone();
        Self {
            router,
            events,
            middleware: RwLock::new(Vec::new()),
            bootstrappers: Mutex::new(Vec::new()),
            bootstrapped: AtomicBool::new(false),
            bootstrap_lock: tokio::sync::Mutex::new(()),
            exception_handler: RwLock::new(Arc::new(DefaultExceptionHandler)),
            terminators: Mutex::new(Vec::new()),
        }
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn set_exception_handler(&self, handler: Arc<dyn ExceptionHandler>) {
        *self.exception_handler.write() = handler;
    }

    /// Append a global middleware shorthand; duplicates are ignored.
    pub fn push_middleware(&self, name: impl Into<String>) {
        let name = name.into();
        let mut middleware = self.middleware.write();
        if !middleware.contains(&name) {
            middleware.push(name);
        }
    }

    /// Put a global middleware shorthand first; duplicates are ignored.
    pub fn prepend_middleware(&self, name: impl Into<String>) {
        let name = name.into();
        let mut middleware = self.middleware.write();
        if !middleware.contains(&name) {
            middleware.insert(0, name);
        }
    }

    pub fn has_middleware(&self, name: &str) -> bool {
        self.middleware.read().iter().any(|m| m == name)
    }

    pub fn add_bootstrapper(&self, bootstrapper: Arc<dyn Bootstrapper>) {
        self.bootstrappers.lock().push(bootstrapper);
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Run the bootstrappers exactly once. A failure leaves the kernel
    /// unbootstrapped so the next request retries.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        if self.is_bootstrapped() {
            return Ok(());
        }
        let _guard = self.bootstrap_lock.lock().await;
        if self.is_bootstrapped() {
            return Ok(());
        }

        let bootstrappers: Vec<Arc<dyn Bootstrapper>> = self.bootstrappers.lock().clone();
        for bootstrapper in bootstrappers {
            bootstrapper.bootstrap().await?;
        }

        self.bootstrapped.store(true, Ordering::Release);
        info!("kernel bootstrapped");
        Ok(())
    }

    /// Register a callback invoked from [`terminate`](Self::terminate).
    pub fn terminating(&self, callback: TerminateCallback) {
        self.terminators.lock().push(callback);
    }

    /// Handle a request. Errors never escape: they are reported through the
    /// exception handler and rendered as responses. `kernel.handled` fires
    /// with the request and response either way.
    pub async fn handle(&self, request: Request) -> Response {
        let response = match self.send_through_router(request.clone()).await {
            Ok(response) => response,
            Err(err) => {
                let handler = self.exception_handler.read().clone();
                handler.report(&err);
                handler.render(&err).prepare(&request)
            }
        };

        if let Err(err) = self
            .events
            .fire(Event::new(
                "kernel.handled",
                vec![payload(request), payload(response.clone())],
            ))
            .await
        {
            error!(error = %err, "kernel.handled listeners failed");
        }

        response
    }

    async fn send_through_router(&self, request: Request) -> Result<Response, Error> {
        self.bootstrap().await?;

        let stages = self.gather_global_middleware()?;
        let router = self.router.clone();
        let destination: HandlerFn = Arc::new(move |request| {
            let router = router.clone();
            Box::pin(async move { router.dispatch(request).await })
        });
        Pipeline::new().through(stages).run(request, destination).await
    }

    fn gather_global_middleware(&self) -> Result<Vec<Arc<dyn Middleware>>, Error> {
        let registry = self.router.middleware_registry();
        self.middleware
            .read()
            .iter()
            .map(|shorthand| {
                registry
                    .resolve(shorthand)
                    .ok_or_else(|| Error::MiddlewareResolution(shorthand.clone()))
            })
            .collect()
    }

    /// Run `terminate` on the matched route's middleware and the global
    /// middleware, then the registered callbacks. Call after the response
    /// has been sent.
    pub async fn terminate(&self, request: &Request, response: &Response) {
        let route = request.route.clone().or_else(|| self.router.current());
        if let Some(route) = route {
            if let Ok(stages) = self.router.gather_route_middleware(&route) {
                for stage in stages {
                    stage.terminate(request, response).await;
                }
            }
        }
        if let Ok(stages) = self.gather_global_middleware() {
            for stage in stages {
                stage.terminate(request, response).await;
            }
        }

        let callbacks = self.terminators.lock();
        for callback in callbacks.iter() {
            callback(request, response);
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Next;
    use crate::route::Action;
    use std::sync::atomic::AtomicUsize;
    use trellis_events::FnListener;

    struct TagMiddleware {
        header: &'static str,
        terminated: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for TagMiddleware {
        async fn handle(&self, request: Request, next: Next) -> Result<Response, Error> {
            Ok(next(request).await?.with_header(self.header, "yes"))
        }

        async fn terminate(&self, _request: &Request, _response: &Response) {
            self.terminated.lock().push(self.header);
        }
    }

    fn kernel_with_route() -> Kernel {
        let kernel = Kernel::new();
        kernel.router().get(
            "/widgets",
            Action::new(|_req| async { Ok(Response::text("widgets")) }),
        );
        kernel
    }

    #[tokio::test]
    async fn requests_pass_through_global_middleware() {
        let kernel = kernel_with_route();
        kernel.router().register_middleware(
            "tag",
            Arc::new(TagMiddleware {
                header: "x-tagged",
                terminated: Arc::new(Mutex::new(Vec::new())),
            }),
        );
        kernel.push_middleware("tag");

        let response = kernel.handle(Request::new(Method::Get, "/widgets")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("x-tagged"), Some(&"yes".to_string()));
    }

    #[tokio::test]
    async fn errors_render_instead_of_escaping() {
        let kernel = kernel_with_route();

        let missing = kernel.handle(Request::new(Method::Get, "/nowhere")).await;
        assert_eq!(missing.status, 404);
        assert_eq!(
            missing.headers.get("Content-Type"),
            Some(&"application/json".to_string())
        );

        let wrong_verb = kernel.handle(Request::new(Method::Post, "/widgets")).await;
        assert_eq!(wrong_verb.status, 405);
        assert_eq!(wrong_verb.headers.get("Allow"), Some(&"GET,HEAD".to_string()));
    }

    #[tokio::test]
    async fn handled_event_fires_for_successes_and_failures() {
        let kernel = kernel_with_route();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = statuses.clone();
        kernel.events().listen(
            "kernel.handled",
            FnListener::arc(move |event: &Event| {
                if let Some(response) = event.payload_item::<Response>(1) {
                    seen.lock().push(response.status);
                }
                None
            }),
            0,
        );

        kernel.handle(Request::new(Method::Get, "/widgets")).await;
        kernel.handle(Request::new(Method::Get, "/nowhere")).await;
        assert_eq!(*statuses.lock(), vec![200, 404]);
    }

    #[tokio::test]
    async fn bootstrap_runs_once_and_retries_after_failure() {
        struct Flaky {
            attempts: AtomicUsize,
        }

        #[async_trait]
        impl Bootstrapper for Flaky {
            async fn bootstrap(&self) -> Result<(), Error> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Internal("warmup failed".to_string()))
                } else {
                    Ok(())
                }
            }
        }

        let kernel = kernel_with_route();
        let flaky = Arc::new(Flaky {
            attempts: AtomicUsize::new(0),
        });
        kernel.add_bootstrapper(flaky.clone());

        let first = kernel.handle(Request::new(Method::Get, "/widgets")).await;
        assert_eq!(first.status, 500);
        assert!(!kernel.is_bootstrapped());

        let second = kernel.handle(Request::new(Method::Get, "/widgets")).await;
        assert_eq!(second.status, 200);
        assert!(kernel.is_bootstrapped());

        kernel.handle(Request::new(Method::Get, "/widgets")).await;
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminate_runs_route_and_global_middleware_then_callbacks() {
        let terminated = Arc::new(Mutex::new(Vec::new()));
        let kernel = Kernel::new();
        let router = kernel.router();
        router.register_middleware(
            "route-tag",
            Arc::new(TagMiddleware {
                header: "x-route",
                terminated: terminated.clone(),
            }),
        );
        router.register_middleware(
            "global-tag",
            Arc::new(TagMiddleware {
                header: "x-global",
                terminated: terminated.clone(),
            }),
        );
        router.get(
            "/widgets",
            Action::new(|_req| async { Ok(Response::ok()) }).middleware(["route-tag"]),
        );
        kernel.push_middleware("global-tag");

        let called = Arc::new(Mutex::new(0));
        let count = called.clone();
        kernel.terminating(Box::new(move |_request, _response| {
            *count.lock() += 1;
        }));

        let request = Request::new(Method::Get, "/widgets");
        let response = kernel.handle(request.clone()).await;
        kernel.terminate(&request, &response).await;

        assert_eq!(*terminated.lock(), vec!["x-route", "x-global"]);
        assert_eq!(*called.lock(), 1);
    }

    #[test]
    fn middleware_list_dedupes_and_prepends() {
        let kernel = Kernel::new();
        kernel.push_middleware("a");
        kernel.push_middleware("b");
        kernel.push_middleware("a");
        kernel.prepend_middleware("c");
        kernel.prepend_middleware("b");

        assert!(kernel.has_middleware("a"));
        assert!(!kernel.has_middleware("d"));
        assert_eq!(*kernel.middleware.read(), vec!["c", "a", "b"]);
    }
}
