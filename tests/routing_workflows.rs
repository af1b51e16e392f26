//! Integration tests for common Trellis workflows.
//!
//! Requests enter through the kernel and exercise routing, groups, filters,
//! middleware, and the event dispatcher together.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use trellis::prelude::*;
use trellis::{DispatchError, TimeoutMiddleware};

// =============================================================================
// Routing Through the Kernel
// =============================================================================

#[tokio::test]
async fn grouped_controller_routes_dispatch_end_to_end() {
    struct UserController;

    #[async_trait]
    impl Controller for UserController {
        async fn call(&self, method: &str, request: Request) -> Result<Response, Error> {
            match method {
                "show" => {
                    let id = request.param("id").cloned().unwrap_or_default();
                    Ok(Response::text(format!("user {id}")))
                }
                other => Err(Error::HandlerResolution(format!("Users#{other}"))),
            }
        }
    }

    let kernel = Kernel::new();
    let router = kernel.router();
    router.register_controller("Admin::Users", Arc::new(UserController));

    router.group(
        GroupAttributes::new()
            .prefix("admin")
            .namespace("Admin")
            .name("admin."),
        |router| {
            router.get(
                "/users/{id}",
                Action::uses("Users#show")
                    .name("users.show")
                    .where_param("id", r"\d+"),
            );
        },
    );

    assert!(router.has_named_route("admin.users.show"));

    let response = kernel.handle(Request::new(Method::Get, "/admin/users/42")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"user 42".to_vec());

    // The constraint rejects non-numeric ids.
    let rejected = kernel.handle(Request::new(Method::Get, "/admin/users/alice")).await;
    assert_eq!(rejected.status, 404);
}

#[tokio::test]
async fn unmatched_verbs_render_405_and_options_advertises_them() {
    let kernel = Kernel::new();
    let router = kernel.router();
    router.get("/widgets", Action::new(|_req| async { Ok(Response::ok()) }));
    router.post("/widgets", Action::new(|_req| async { Ok(Response::created()) }));

    let response = kernel.handle(Request::new(Method::Put, "/widgets")).await;
    assert_eq!(response.status, 405);
    assert_eq!(
        response.headers.get("Allow"),
        Some(&"GET,HEAD,POST".to_string())
    );

    let options = kernel.handle(Request::new(Method::Options, "/widgets")).await;
    assert_eq!(options.status, 200);
    assert_eq!(
        options.headers.get("Allow"),
        Some(&"GET,HEAD,POST".to_string())
    );
}

#[tokio::test]
async fn head_requests_reuse_get_routes_with_empty_prepared_bodies() {
    let kernel = Kernel::new();
    kernel
        .router()
        .get("/widgets", Action::new(|_req| async { Ok(Response::text("widgets")) }));

    let response = kernel.handle(Request::new(Method::Head, "/widgets")).await;
    assert_eq!(response.status, 200);
    assert!(response.body.is_empty());
    assert_eq!(response.headers.get("Content-Length"), Some(&"7".to_string()));
}

#[tokio::test]
async fn domain_groups_capture_tenant_parameters() {
    let kernel = Kernel::new();
    kernel.router().group(
        GroupAttributes::new().domain("{tenant}.example.com"),
        |router| {
            router.get(
                "/dashboard",
                Action::new(|req| async move {
                    let tenant = req.param("tenant").cloned().unwrap_or_default();
                    Ok(Response::text(tenant))
                }),
            );
        },
    );

    let request = Request::new(Method::Get, "/dashboard").with_domain("acme.example.com");
    let response = kernel.handle(request).await;
    assert_eq!(response.body, b"acme".to_vec());

    // Without the domain the route does not exist.
    let missing = kernel.handle(Request::new(Method::Get, "/dashboard")).await;
    assert_eq!(missing.status, 404);
}

// =============================================================================
// Middleware and Filters
// =============================================================================

struct HeaderMiddleware(&'static str);

#[async_trait]
impl Middleware for HeaderMiddleware {
    async fn handle(&self, request: Request, next: Next) -> Result<Response, Error> {
        Ok(next(request).await?.with_header(self.0, "yes"))
    }
}

#[tokio::test]
async fn group_and_route_middleware_run_around_the_handler() {
    let kernel = Kernel::new();
    let router = kernel.router();
    router.register_middleware("outer", Arc::new(HeaderMiddleware("x-outer")));
    router.register_middleware("inner", Arc::new(HeaderMiddleware("x-inner")));

    router.group(GroupAttributes::new().middleware(["outer"]), |router| {
        router.get(
            "/widgets",
            Action::new(|_req| async { Ok(Response::ok()) }).middleware(["inner"]),
        );
    });

    let response = kernel.handle(Request::new(Method::Get, "/widgets")).await;
    assert_eq!(response.headers.get("x-outer"), Some(&"yes".to_string()));
    assert_eq!(response.headers.get("x-inner"), Some(&"yes".to_string()));
}

#[tokio::test]
async fn timeout_middleware_turns_slow_handlers_into_504s() {
    let kernel = Kernel::new();
    let router = kernel.router();
    router.register_middleware(
        "timeout",
        Arc::new(TimeoutMiddleware::new(std::time::Duration::from_millis(20))),
    );
    router.get(
        "/slow",
        Action::new(|_req| async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(Response::ok())
        })
        .middleware(["timeout"]),
    );

    let response = kernel.handle(Request::new(Method::Get, "/slow")).await;
    assert_eq!(response.status, 504);
}

#[tokio::test]
async fn pattern_filters_block_guarded_sections() {
    let kernel = Kernel::new();
    let router = kernel.router();
    router.get("/admin/panel", Action::new(|_req| async { Ok(Response::ok()) }));
    router.get("/open", Action::new(|_req| async { Ok(Response::ok()) }));

    router.filter(
        "auth",
        FnListener::arc(|event: &Event| {
            let request = event.payload_item::<Request>(1)?;
            if request.header("authorization").is_some() {
                None
            } else {
                Some(value(Response::new(401).with_body(b"login required".to_vec())))
            }
        }),
    );
    router.when("admin/*", "auth", None);

    let blocked = kernel.handle(Request::new(Method::Get, "/admin/panel")).await;
    assert_eq!(blocked.status, 401);

    let authed = kernel
        .handle(Request::new(Method::Get, "/admin/panel").with_header("authorization", "token"))
        .await;
    assert_eq!(authed.status, 200);

    let open = kernel.handle(Request::new(Method::Get, "/open")).await;
    assert_eq!(open.status, 200);
}

#[tokio::test]
async fn binders_feed_handlers_and_missing_bindings_render_404() {
    let kernel = Kernel::new();
    let router = kernel.router();
    router.get(
        "/widgets/{widget}",
        Action::new(|req| async move {
            let widget = req.binding("widget").cloned().unwrap_or_default();
            Response::json(&widget)
        }),
    );
    router.bind(
        "widget",
        Arc::new(|value, _route| {
            Ok(match value {
                "bolt" => Some(serde_json::json!({"name": "bolt", "stock": 12})),
                _ => None,
            })
        }),
    );

    let found = kernel.handle(Request::new(Method::Get, "/widgets/bolt")).await;
    assert_eq!(found.status, 200);
    let body: serde_json::Value = serde_json::from_slice(&found.body).unwrap();
    assert_eq!(body["stock"], 12);

    let missing = kernel.handle(Request::new(Method::Get, "/widgets/gadget")).await;
    assert_eq!(missing.status, 404);
}

// =============================================================================
// Events Around the Request Cycle
// =============================================================================

#[tokio::test]
async fn listeners_observe_matches_and_handled_requests() {
    let kernel = Kernel::new();
    let router = kernel.router();
    router.get(
        "/widgets",
        Action::new(|_req| async { Ok(Response::ok()) }).name("widgets.index"),
    );

    let log = Arc::new(Mutex::new(Vec::new()));

    let matched_log = log.clone();
    router.matched(FnListener::arc(move |event: &Event| {
        let route = event.payload_item::<Arc<Route>>(0)?;
        matched_log
            .lock()
            .unwrap()
            .push(format!("matched {}", route.name().unwrap_or("?")));
        None
    }));

    let handled_log = log.clone();
    kernel.events().listen(
        "kernel.handled",
        FnListener::arc(move |event: &Event| {
            let response = event.payload_item::<Response>(1)?;
            handled_log
                .lock()
                .unwrap()
                .push(format!("handled {}", response.status));
            None
        }),
        0,
    );

    kernel.handle(Request::new(Method::Get, "/widgets")).await;
    assert_eq!(
        *log.lock().unwrap(),
        vec!["matched widgets.index".to_string(), "handled 200".to_string()]
    );
}

#[tokio::test]
async fn dispatcher_orders_by_priority_and_halts_on_demand() {
    let events = EventDispatcher::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (tag, priority) in [("low", 0), ("high", 10), ("mid", 5)] {
        let order = order.clone();
        events.listen(
            "deploy",
            FnListener::arc(move |_event: &Event| {
                order.lock().unwrap().push(tag);
                None
            }),
            priority,
        );
    }

    events.fire(Event::named("deploy")).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);

    // until() stops at the first non-null answer.
    events.listen(
        "lookup",
        FnListener::arc(|_event: &Event| Some(value("hit".to_string()))),
        10,
    );
    let tripped = Arc::new(AtomicUsize::new(0));
    let count = tripped.clone();
    events.listen(
        "lookup",
        FnListener::arc(move |_event: &Event| {
            count.fetch_add(1, Ordering::SeqCst);
            None
        }),
        0,
    );

    let answer = events.until(Event::named("lookup")).await.unwrap().unwrap();
    assert_eq!(answer.downcast_ref::<String>().unwrap(), "hit");
    assert_eq!(tripped.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn false_return_stops_propagation_and_wildcards_hear_everything() {
    let events = EventDispatcher::new();
    let heard = Arc::new(Mutex::new(Vec::new()));

    let stopper = heard.clone();
    events.listen(
        "orders.created",
        FnListener::arc(move |_event: &Event| {
            stopper.lock().unwrap().push("first");
            Some(halt_propagation())
        }),
        5,
    );
    let silenced = heard.clone();
    events.listen(
        "orders.created",
        FnListener::arc(move |_event: &Event| {
            silenced.lock().unwrap().push("second");
            None
        }),
        0,
    );
    let wildcard = heard.clone();
    events.listen(
        "orders.*",
        FnListener::arc(move |event: &Event| {
            wildcard.lock().unwrap().push(if event.name == "orders.created" {
                "wildcard"
            } else {
                "other"
            });
            None
        }),
        0,
    );

    let responses = events.fire(Event::named("orders.created")).await.unwrap();
    // Propagation stopped before the second listener and the wildcard.
    assert_eq!(*heard.lock().unwrap(), vec!["first"]);
    assert!(responses.is_empty());
}

#[tokio::test]
async fn pushed_events_replay_on_flush() {
    let events = EventDispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    events.listen(
        "reports.ready",
        FnListener::arc(move |event: &Event| {
            let batch = event.payload_item::<String>(0)?;
            log.lock().unwrap().push(batch.clone());
            None
        }),
        0,
    );

    events.push(Event::new("reports.ready", vec![payload("batch-1".to_string())]));
    events.push(Event::new("reports.ready", vec![payload("batch-2".to_string())]));
    assert!(seen.lock().unwrap().is_empty());

    events.flush("reports.ready").await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["batch-1".to_string(), "batch-2".to_string()]
    );
}

#[tokio::test]
async fn named_listeners_resolve_at_fire_time_or_error() {
    struct Audit;

    #[async_trait]
    impl Listener for Audit {
        async fn handle(&self, _event: &Event) -> Result<Option<trellis::ListenerValue>, DispatchError> {
            Ok(Some(value("audited".to_string())))
        }
    }

    let events = EventDispatcher::new();
    events.set_listener_resolver(Arc::new(|target, _method| {
        (target == "Audit").then(|| Arc::new(Audit) as Arc<dyn Listener>)
    }));

    events.listen_named("payments.settled", "Audit", 0);
    events.listen_named("payments.failed", "Missing#record", 0);

    let responses = events.fire(Event::named("payments.settled")).await.unwrap();
    assert_eq!(responses.len(), 1);

    let err = events.fire(Event::named("payments.failed")).await.unwrap_err();
    assert!(matches!(err, DispatchError::ListenerResolution(_)));
}

// =============================================================================
// Kernel Lifecycle
// =============================================================================

#[tokio::test]
async fn terminate_callbacks_run_after_the_response() {
    let kernel = Kernel::new();
    kernel
        .router()
        .get("/widgets", Action::new(|_req| async { Ok(Response::ok()) }));

    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();
    kernel.terminating(Box::new(move |request, response| {
        seen.lock()
            .unwrap()
            .push(format!("{} {} -> {}", request.method, request.path, response.status));
    }));

    let request = Request::new(Method::Get, "/widgets");
    let response = kernel.handle(request.clone()).await;
    kernel.terminate(&request, &response).await;

    assert_eq!(*log.lock().unwrap(), vec!["GET /widgets -> 200".to_string()]);
}

#[tokio::test]
async fn before_filters_can_serve_maintenance_pages() {
    let kernel = Kernel::new();
    let router = kernel.router();
    router.get("/widgets", Action::new(|_req| async { Ok(Response::ok()) }));
    router.before(FnListener::arc(|_event: &Event| {
        Some(value(Response::new(503).with_body(b"down for maintenance".to_vec())))
    }));

    let response = kernel.handle(Request::new(Method::Get, "/widgets")).await;
    assert_eq!(response.status, 503);
    assert_eq!(response.body, b"down for maintenance".to_vec());
}
