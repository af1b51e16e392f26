// Router: registration surface, group stack, filters, and dispatch

use crate::collection::RouteCollection;
use crate::group::{GroupAttributes, GroupStack, join_prefix};
use crate::http::{Method, Request, Response};
use crate::middleware::{Middleware, MiddlewareRegistry, parse_shorthand};
use crate::pipeline::Pipeline;
use crate::route::{Action, Controller, ControllerRegistry, Handler, HandlerFn, Route};
use crate::Error;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_events::{Event, EventDispatcher, Listener, ListenerValue, PayloadItem, payload, pattern_matches};

/// Maps a raw path parameter to its bound value. `Ok(None)` means the value
/// does not exist; the dispatcher turns that into a 404.
pub type Binder =
    Arc<dyn Fn(&str, &Route) -> Result<Option<serde_json::Value>, Error> + Send + Sync>;

struct PatternFilter {
    pattern: String,
    filter: String,
    methods: Option<Vec<Method>>,
}

struct RegexFilter {
    regex: Regex,
    filter: String,
    methods: Option<Vec<Method>>,
}

/// The routing core: routes are registered through `&self` (every table sits
/// behind a lock), grouped registration stacks shared attributes, and
/// dispatch pushes matched requests through filters and the middleware
/// pipeline into the route handler.
pub struct Router {
    events: EventDispatcher,
    routes: RwLock<RouteCollection>,
    controllers: Arc<ControllerRegistry>,
    middleware: Arc<MiddlewareRegistry>,
    groups: GroupStack,
    patterns: RwLock<HashMap<String, String>>,
    binders: RwLock<HashMap<String, Binder>>,
    pattern_filters: RwLock<Vec<PatternFilter>>,
    regex_filters: RwLock<Vec<RegexFilter>>,
    current: RwLock<Option<Arc<Route>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_events(EventDispatcher::new())
    }

    pub fn with_events(events: EventDispatcher) -> Self {
        Self {
            events,
            routes: RwLock::new(RouteCollection::new()),
            controllers: Arc::new(ControllerRegistry::new()),
            middleware: Arc::new(MiddlewareRegistry::new()),
            groups: GroupStack::new(),
            patterns: RwLock::new(HashMap::new()),
            binders: RwLock::new(HashMap::new()),
            pattern_filters: RwLock::new(Vec::new()),
            regex_filters: RwLock::new(Vec::new()),
            current: RwLock::new(None),
        }
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn controllers(&self) -> Arc<ControllerRegistry> {
        self.controllers.clone()
    }

    pub fn middleware_registry(&self) -> Arc<MiddlewareRegistry> {
        self.middleware.clone()
    }

    pub fn register_controller(&self, name: impl Into<String>, controller: Arc<dyn Controller>) {
        self.controllers.register(name, controller);
    }

    pub fn register_middleware(&self, name: impl Into<String>, middleware: Arc<dyn Middleware>) {
        self.middleware.register(name, middleware);
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// GET routes also answer HEAD.
    pub fn get(&self, uri: &str, action: Action) -> Arc<Route> {
        self.add_route(vec![Method::Get, Method::Head], uri, action)
    }

    pub fn post(&self, uri: &str, action: Action) -> Arc<Route> {
        self.add_route(vec![Method::Post], uri, action)
    }

    pub fn put(&self, uri: &str, action: Action) -> Arc<Route> {
        self.add_route(vec![Method::Put], uri, action)
    }

    pub fn patch(&self, uri: &str, action: Action) -> Arc<Route> {
        self.add_route(vec![Method::Patch], uri, action)
    }

    pub fn delete(&self, uri: &str, action: Action) -> Arc<Route> {
        self.add_route(vec![Method::Delete], uri, action)
    }

    pub fn options(&self, uri: &str, action: Action) -> Arc<Route> {
        self.add_route(vec![Method::Options], uri, action)
    }

    /// Every verb except OPTIONS.
    pub fn any(&self, uri: &str, action: Action) -> Arc<Route> {
        self.add_route(
            vec![
                Method::Get,
                Method::Head,
                Method::Post,
                Method::Put,
                Method::Patch,
                Method::Delete,
            ],
            uri,
            action,
        )
    }

    /// Register for an explicit verb list.
    pub fn match_methods(&self, methods: Vec<Method>, uri: &str, action: Action) -> Arc<Route> {
        self.add_route(methods, uri, action)
    }

    /// The funnel every registration goes through: qualify controller
    /// references against the group namespace, apply the group prefix and
    /// attributes, fill `where` constraints from global patterns, store.
    pub fn add_route(&self, methods: Vec<Method>, uri: &str, action: Action) -> Arc<Route> {
        let mut action = action;
        let group = self.groups.last();

        if let Handler::Named { target, method } = &action.handler {
            action.handler = Handler::Named {
                target: qualify_target(
                    target,
                    group.as_ref().and_then(|g| g.namespace.as_deref()),
                ),
                method: method.clone(),
            };
        }

        let uri = match group.as_ref().and_then(|g| g.prefix.as_deref()) {
            Some(prefix) => join_prefix(Some(prefix), uri),
            None => uri.to_string(),
        };

        if let Some(group) = &group {
            action = merge_group_into_action(action, group);
        }

        {
            // Global patterns fill in constraints the route doesn't set itself.
            let patterns = self.patterns.read();
            for (key, pattern) in patterns.iter() {
                action
                    .wheres
                    .entry(key.clone())
                    .or_insert_with(|| pattern.clone());
            }
        }

        debug!(methods = ?methods, uri = %uri, name = ?action.name, "registering route");
        self.routes.write().add(Route::new(methods, &uri, action))
    }

    /// Register routes sharing the group's attributes. Nesting composes:
    /// prefixes join, namespaces and names concatenate, middleware appends.
    pub fn group<F>(&self, attributes: GroupAttributes, register: F)
    where
        F: FnOnce(&Router),
    {
        let _guard = self.groups.enter(attributes);
        register(self);
    }

    pub fn group_depth(&self) -> usize {
        self.groups.depth()
    }

    /// Set a global constraint applied to every route parameter of this name.
    pub fn pattern(&self, key: impl Into<String>, pattern: impl Into<String>) {
        self.patterns.write().insert(key.into(), pattern.into());
    }

    pub fn patterns(&self) -> HashMap<String, String> {
        self.patterns.read().clone()
    }

    /// Register a binder for a route parameter. Dashes in the key are
    /// normalized to underscores.
    pub fn bind(&self, key: &str, binder: Binder) {
        self.binders.write().insert(key.replace('-', "_"), binder);
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// Global before filter; a non-null response short-circuits dispatch.
    pub fn before(&self, listener: Arc<dyn Listener>) {
        self.events.listen("router.before", listener, 0);
    }

    /// Global after filter; runs once the response is prepared.
    pub fn after(&self, listener: Arc<dyn Listener>) {
        self.events.listen("router.after", listener, 0);
    }

    /// Listener for successful route matches.
    pub fn matched(&self, listener: Arc<dyn Listener>) {
        self.events.listen("router.matched", listener, 0);
    }

    /// Register a named filter addressable from routes and `when` patterns.
    pub fn filter(&self, name: &str, listener: Arc<dyn Listener>) {
        self.events
            .listen(&format!("router.filter: {name}"), listener, 0);
    }

    /// Run a named filter before any request whose path matches the glob.
    pub fn when(&self, pattern: &str, filter: &str, methods: Option<Vec<Method>>) {
        self.pattern_filters.write().push(PatternFilter {
            pattern: pattern.to_string(),
            filter: filter.to_string(),
            methods,
        });
    }

    /// Like [`when`](Self::when) with a full regex instead of a glob.
    pub fn when_regex(
        &self,
        pattern: &str,
        filter: &str,
        methods: Option<Vec<Method>>,
    ) -> Result<(), Error> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Internal(format!("invalid filter pattern: {e}")))?;
        self.regex_filters.write().push(RegexFilter {
            regex,
            filter: filter.to_string(),
            methods,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub async fn dispatch(&self, request: Request) -> Result<Response, Error> {
        let response = match self.call_global_filter("router.before", &request).await? {
            Some(response) => response,
            None => self.dispatch_to_route(request.clone()).await?,
        };

        // The response is already settled; an after-filter failure must not
        // change it.
        let response = response.prepare(&request);
        if let Err(err) = self
            .events
            .fire(Event::new(
                "router.after",
                vec![payload(request), payload(response.clone())],
            ))
            .await
        {
            warn!(error = %err, "after filter failed");
        }
        Ok(response)
    }

    /// Match, bind, and run, skipping the global before/after filters.
    pub async fn dispatch_to_route(&self, mut request: Request) -> Result<Response, Error> {
        let route = self.find_route(&mut request)?;
        request.route = Some(route.clone());

        self.events
            .fire(Event::new(
                "router.matched",
                vec![payload(route.clone()), payload(request.clone())],
            ))
            .await?;

        let response = match self.call_route_before(&route, &request).await? {
            Some(response) => response,
            None => self.run_route_within_stack(route.clone(), request.clone()).await?,
        };

        let response = response.prepare(&request);
        if let Err(err) = self.call_route_after(&route, &request, &response).await {
            warn!(error = %err, "route after filters failed");
        }
        Ok(response)
    }

    fn find_route(&self, request: &mut Request) -> Result<Arc<Route>, Error> {
        let route = self.routes.read().find(request)?;
        *self.current.write() = Some(route.clone());
        self.substitute_bindings(&route, request)?;
        Ok(route)
    }

    fn substitute_bindings(&self, route: &Arc<Route>, request: &mut Request) -> Result<(), Error> {
        let params: Vec<(String, String)> = request
            .path_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in params {
            let binder = self.binders.read().get(&key).cloned();
            if let Some(binder) = binder {
                match binder(&value, route)? {
                    Some(bound) => {
                        request.bindings.insert(key, bound);
                    }
                    None => return Err(Error::BindingNotFound(key)),
                }
            }
        }
        Ok(())
    }

    async fn run_route_within_stack(
        &self,
        route: Arc<Route>,
        request: Request,
    ) -> Result<Response, Error> {
        let stages = self.gather_route_middleware(&route)?;
        let controllers = self.controllers.clone();
        let destination: HandlerFn = Arc::new(move |request| {
            let route = route.clone();
            let controllers = controllers.clone();
            Box::pin(async move { route.run(request, &controllers).await })
        });
        Pipeline::new().through(stages).run(request, destination).await
    }

    /// Resolve a route's middleware shorthands to instances.
    pub fn gather_route_middleware(
        &self,
        route: &Route,
    ) -> Result<Vec<Arc<dyn Middleware>>, Error> {
        route
            .middleware()
            .iter()
            .map(|shorthand| {
                self.middleware
                    .resolve(shorthand)
                    .ok_or_else(|| Error::MiddlewareResolution(shorthand.clone()))
            })
            .collect()
    }

    async fn call_global_filter(
        &self,
        event: &str,
        request: &Request,
    ) -> Result<Option<Response>, Error> {
        let value = self
            .events
            .until(Event::new(event, vec![payload(request.clone())]))
            .await?;
        Ok(value.and_then(coerce_response))
    }

    async fn call_route_before(
        &self,
        route: &Arc<Route>,
        request: &Request,
    ) -> Result<Option<Response>, Error> {
        for (filter, params) in self.find_pattern_filters(request) {
            if let Some(response) = self
                .call_route_filter(&filter, &params, route, request, None)
                .await?
            {
                return Ok(Some(response));
            }
        }
        for shorthand in &route.action().before_filters {
            let (name, params) = parse_shorthand(shorthand);
            if let Some(response) = self
                .call_route_filter(name, &params, route, request, None)
                .await?
            {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    async fn call_route_after(
        &self,
        route: &Arc<Route>,
        request: &Request,
        response: &Response,
    ) -> Result<(), Error> {
        for shorthand in &route.action().after_filters {
            let (name, params) = parse_shorthand(shorthand);
            let mut items: Vec<PayloadItem> = vec![
                payload(route.clone()),
                payload(request.clone()),
                payload(response.clone()),
            ];
            items.extend(params.into_iter().map(payload));
            self.events
                .fire(Event::new(format!("router.filter: {name}"), items))
                .await?;
        }
        Ok(())
    }

    async fn call_route_filter(
        &self,
        name: &str,
        params: &[String],
        route: &Arc<Route>,
        request: &Request,
        response: Option<&Response>,
    ) -> Result<Option<Response>, Error> {
        let mut items: Vec<PayloadItem> =
            vec![payload(route.clone()), payload(request.clone())];
        if let Some(response) = response {
            items.push(payload(response.clone()));
        }
        items.extend(params.iter().cloned().map(payload));
        let value = self
            .events
            .until(Event::new(format!("router.filter: {name}"), items))
            .await?;
        Ok(value.and_then(coerce_response))
    }

    /// Named filters whose glob or regex pattern matches the request path
    /// (without the leading slash) and verb.
    fn find_pattern_filters(&self, request: &Request) -> Vec<(String, Vec<String>)> {
        let path = request.path.trim_start_matches('/');
        let method_allows =
            |methods: &Option<Vec<Method>>| methods.as_ref().is_none_or(|m| m.contains(&request.method));

        let mut filters = Vec::new();
        for entry in self.pattern_filters.read().iter() {
            if method_allows(&entry.methods) && pattern_matches(&entry.pattern, path) {
                let (name, params) = parse_shorthand(&entry.filter);
                filters.push((name.to_string(), params));
            }
        }
        for entry in self.regex_filters.read().iter() {
            if method_allows(&entry.methods) && entry.regex.is_match(path) {
                let (name, params) = parse_shorthand(&entry.filter);
                filters.push((name.to_string(), params));
            }
        }
        filters
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// The most recently matched route.
    pub fn current(&self) -> Option<Arc<Route>> {
        self.current.read().clone()
    }

    pub fn current_route_name(&self) -> Option<String> {
        self.current().and_then(|route| route.name().map(String::from))
    }

    /// Whether the current route's name matches any of the globs.
    pub fn is_route_named(&self, patterns: &[&str]) -> bool {
        match self.current_route_name() {
            Some(name) => patterns.iter().any(|pattern| pattern_matches(pattern, &name)),
            None => false,
        }
    }

    pub fn has_named_route(&self, name: &str) -> bool {
        self.routes.read().has_named_route(name)
    }

    pub fn route_by_name(&self, name: &str) -> Option<Arc<Route>> {
        self.routes.read().get_by_name(name)
    }

    pub fn route_by_action(&self, reference: &str) -> Option<Arc<Route>> {
        self.routes.read().get_by_action(reference)
    }

    pub fn refresh_name_lookups(&self) {
        self.routes.write().refresh_name_lookups();
    }

    /// Snapshot of every registered route.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.read().routes().to_vec()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Prepend the group namespace unless the reference is fully qualified with
/// a leading `::`.
fn qualify_target(target: &str, namespace: Option<&str>) -> String {
    if let Some(stripped) = target.strip_prefix("::") {
        return stripped.to_string();
    }
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}::{target}"),
        _ => target.to_string(),
    }
}

fn merge_group_into_action(mut action: Action, group: &GroupAttributes) -> Action {
    action.name = match &group.name {
        Some(prefix) => Some(format!(
            "{prefix}{}",
            action.name.as_deref().unwrap_or_default()
        )),
        None => action.name,
    };
    action.domain = action.domain.or_else(|| group.domain.clone());

    let mut middleware = group.middleware.clone();
    middleware.extend(action.middleware);
    action.middleware = middleware;

    let mut wheres = group.wheres.clone();
    wheres.extend(action.wheres);
    action.wheres = wheres;

    action
}

/// Filters may answer with a full response or a plain string.
fn coerce_response(value: ListenerValue) -> Option<Response> {
    if let Some(response) = value.downcast_ref::<Response>() {
        return Some(response.clone());
    }
    if let Some(text) = value.downcast_ref::<String>() {
        return Some(Response::text(text.clone()));
    }
    if let Some(text) = value.downcast_ref::<&'static str>() {
        return Some(Response::text(*text));
    }
    warn!("filter response ignored: unsupported type");
    None
}
