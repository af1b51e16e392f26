// Route collection: ordered storage, lookup tables, and request matching

use crate::http::{Method, Request, Response};
use crate::route::{Action, Route};
use crate::Error;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Insertion-ordered routes for one method, keyed by domain+uri.
/// Re-registering a key replaces the route in its original slot.
#[derive(Default)]
struct MethodBucket {
    order: Vec<Arc<Route>>,
    index: HashMap<String, usize>,
}

impl MethodBucket {
    fn insert(&mut self, key: String, route: Arc<Route>) {
        match self.index.get(&key) {
            Some(&slot) => self.order[slot] = route,
            None => {
                self.index.insert(key, self.order.len());
                self.order.push(route);
            }
        }
    }
}

/// All registered routes, with first-match-wins resolution and name/action
/// lookup tables.
#[derive(Default)]
pub struct RouteCollection {
    routes: HashMap<Method, MethodBucket>,
    all: Vec<Arc<Route>>,
    all_index: HashMap<String, usize>,
    names: HashMap<String, Arc<Route>>,
    actions: HashMap<String, Arc<Route>>,
}

impl RouteCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a route under each of its methods and refresh the lookup tables.
    pub fn add(&mut self, route: Route) -> Arc<Route> {
        let route = Arc::new(route);
        let domain_and_uri = format!("{}{}", route.domain().unwrap_or(""), route.uri());

        for method in route.methods() {
            self.routes
                .entry(*method)
                .or_default()
                .insert(domain_and_uri.clone(), route.clone());

            let key = format!("{method}{domain_and_uri}");
            match self.all_index.get(&key) {
                Some(&slot) => self.all[slot] = route.clone(),
                None => {
                    self.all_index.insert(key, self.all.len());
                    self.all.push(route.clone());
                }
            }
        }

        self.add_lookups(&route);
        route
    }

    fn add_lookups(&mut self, route: &Arc<Route>) {
        if let Some(name) = route.name() {
            self.names.insert(name.to_string(), route.clone());
        }
        if let Some(reference) = route.handler_reference() {
            self.actions.insert(reference, route.clone());
        }
    }

    /// Rebuild the name and action tables from the stored routes.
    pub fn refresh_name_lookups(&mut self) {
        self.names.clear();
        self.actions.clear();
        let routes: Vec<Arc<Route>> = self.all.clone();
        for route in &routes {
            self.add_lookups(route);
        }
    }

    /// Find the first route matching the request. Falls back to an
    /// alternate-verb check: OPTIONS requests get a synthesized 200 response
    /// advertising the supported verbs, anything else is a 405.
    pub fn find(&self, request: &mut Request) -> Result<Arc<Route>, Error> {
        if let Some(route) = self.check(request.method, request, true) {
            debug!(method = %request.method, path = %request.path, uri = %route.uri(), "route matched");
            route.bind(request);
            return Ok(route);
        }

        let others = self.alternate_verbs(request);
        if !others.is_empty() {
            if request.method == Method::Options {
                let route = Self::options_route(&request.path, &others);
                route.bind(request);
                return Ok(route);
            }
            return Err(Error::MethodNotAllowed { allowed: others });
        }

        Err(Error::RouteNotFound(format!(
            "{} {}",
            request.method, request.path
        )))
    }

    fn check(&self, method: Method, request: &Request, including_method: bool) -> Option<Arc<Route>> {
        self.routes.get(&method)?.order.iter().find_map(|route| {
            route
                .matches(request, including_method)
                .then(|| route.clone())
        })
    }

    /// Verbs other than the request's that would have matched this URI.
    fn alternate_verbs(&self, request: &Request) -> Vec<Method> {
        Method::ALL
            .into_iter()
            .filter(|method| *method != request.method)
            .filter(|method| self.check(*method, request, false).is_some())
            .collect()
    }

    /// A synthesized route answering OPTIONS with the supported verbs.
    fn options_route(path: &str, others: &[Method]) -> Arc<Route> {
        let allow = others
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Arc::new(Route::new(
            vec![Method::Options],
            path,
            Action::new(move |_request| {
                let allow = allow.clone();
                async move { Ok(Response::ok().with_header("Allow", allow)) }
            }),
        ))
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Route>> {
        self.names.get(name).cloned()
    }

    pub fn get_by_action(&self, reference: &str) -> Option<Arc<Route>> {
        self.actions.get(reference).cloned()
    }

    pub fn has_named_route(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Every stored route, in registration order (one entry per route and
    /// method).
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.all
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}
