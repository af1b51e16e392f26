// Route definitions: handlers, action descriptors, compiled patterns

use crate::{Error, Request, Response};
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use tracing::error;

use crate::http::Method;

/// Type alias for handler functions
pub type HandlerFn = Arc<
    dyn Fn(Request) -> Pin<Box<dyn Future<Output = Result<Response, Error>> + Send>> + Send + Sync,
>;

/// A controller exposes named methods to routes registered with
/// `"Target#method"` references.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn call(&self, method: &str, request: Request) -> Result<Response, Error>;
}

/// Registry of controllers addressable by name.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: RwLock<HashMap<String, Arc<dyn Controller>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, controller: Arc<dyn Controller>) {
        self.controllers.write().insert(name.into(), controller);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Controller>> {
        self.controllers.read().get(name).cloned()
    }
}

/// What a route invokes when it runs.
#[derive(Clone)]
pub enum Handler {
    /// An inline closure.
    Closure(HandlerFn),
    /// A controller reference resolved at run time.
    Named { target: String, method: String },
}

impl Handler {
    /// Parse a `"Target#method"` reference; the method defaults to `handle`.
    pub fn parse(reference: &str) -> Handler {
        match reference.split_once('#') {
            Some((target, method)) => Handler::Named {
                target: target.to_string(),
                method: method.to_string(),
            },
            None => Handler::Named {
                target: reference.to_string(),
                method: "handle".to_string(),
            },
        }
    }

    /// The `"Target#method"` form of a named handler.
    pub fn reference(&self) -> Option<String> {
        match self {
            Handler::Named { target, method } => Some(format!("{target}#{method}")),
            Handler::Closure(_) => None,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Closure(_) => f.write_str("Closure"),
            Handler::Named { target, method } => write!(f, "Named({target}#{method})"),
        }
    }
}

/// Everything a route does besides match: its handler, name, attached
/// middleware and filters, parameter constraints, and domain restriction.
#[derive(Clone)]
pub struct Action {
    pub handler: Handler,
    pub name: Option<String>,
    pub domain: Option<String>,
    pub middleware: Vec<String>,
    pub wheres: HashMap<String, String>,
    pub before_filters: Vec<String>,
    pub after_filters: Vec<String>,
}

impl Action {
    /// An action around an inline closure.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |request| Box::pin(handler(request)));
        Self::from_handler(Handler::Closure(handler))
    }

    /// An action around a `"Target#method"` controller reference.
    pub fn uses(reference: &str) -> Self {
        Self::from_handler(Handler::parse(reference))
    }

    pub fn from_handler(handler: Handler) -> Self {
        Self {
            handler,
            name: None,
            domain: None,
            middleware: Vec::new(),
            wheres: HashMap::new(),
            before_filters: Vec::new(),
            after_filters: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn middleware<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.middleware.extend(names.into_iter().map(Into::into));
        self
    }

    /// Constrain a path parameter with a regex.
    pub fn where_param(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.wheres.insert(name.into(), pattern.into());
        self
    }

    /// Attach a before filter (`"name"` or `"name:arg1,arg2"`).
    pub fn before_filter(mut self, filter: impl Into<String>) -> Self {
        self.before_filters.push(filter.into());
        self
    }

    /// Attach an after filter.
    pub fn after_filter(mut self, filter: impl Into<String>) -> Self {
        self.after_filters.push(filter.into());
        self
    }
}

/// A route's URI and domain patterns, compiled once on first match.
struct CompiledRoute {
    path_regex: Regex,
    path_params: Vec<String>,
    domain_regex: Option<Regex>,
    domain_params: Vec<String>,
}

impl CompiledRoute {
    fn build(
        uri: &str,
        domain: Option<&str>,
        wheres: &HashMap<String, String>,
    ) -> Result<Self, regex::Error> {
        let mut path_params = Vec::new();
        let path_regex = Regex::new(&compile_pattern(uri, wheres, &mut path_params))?;

        let mut domain_params = Vec::new();
        let domain_regex = match domain {
            Some(domain) => Some(Regex::new(&compile_pattern(
                domain,
                wheres,
                &mut domain_params,
            ))?),
            None => None,
        };

        Ok(Self {
            path_regex,
            path_params,
            domain_regex,
            domain_params,
        })
    }
}

/// Turn `/widgets/{id}` into `^/widgets/(?P<id>[^/]+)$`, honoring `where`
/// constraints per parameter.
fn compile_pattern(pattern: &str, wheres: &HashMap<String, String>, params: &mut Vec<String>) -> String {
    let mut regex = String::from("^");
    let mut literal = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '{' {
            literal.push(c);
            continue;
        }
        regex.push_str(&regex::escape(&literal));
        literal.clear();
        let mut name = String::new();
        for c in chars.by_ref() {
            if c == '}' {
                break;
            }
            name.push(c);
        }
        let constraint = wheres.get(&name).map(String::as_str).unwrap_or("[^/]+");
        regex.push_str(&format!("(?P<{name}>{constraint})"));
        params.push(name);
    }
    regex.push_str(&regex::escape(&literal));
    regex.push('$');
    regex
}

fn normalize_uri(uri: &str) -> String {
    let trimmed = uri.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// A registered route. Immutable once added; the compiled pattern is derived
/// lazily and exactly once.
pub struct Route {
    methods: Vec<Method>,
    uri: String,
    action: Action,
    compiled: OnceLock<Option<CompiledRoute>>,
}

impl Route {
    pub fn new(methods: Vec<Method>, uri: &str, action: Action) -> Self {
        Self {
            methods,
            uri: normalize_uri(uri),
            action,
            compiled: OnceLock::new(),
        }
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn name(&self) -> Option<&str> {
        self.action.name.as_deref()
    }

    pub fn domain(&self) -> Option<&str> {
        self.action.domain.as_deref()
    }

    pub fn middleware(&self) -> &[String] {
        &self.action.middleware
    }

    pub fn wheres(&self) -> &HashMap<String, String> {
        &self.action.wheres
    }

    /// The `"Target#method"` reference for controller routes.
    pub fn handler_reference(&self) -> Option<String> {
        self.action.handler.reference()
    }

    fn compiled(&self) -> Option<&CompiledRoute> {
        self.compiled
            .get_or_init(
                || match CompiledRoute::build(&self.uri, self.domain(), &self.action.wheres) {
                    Ok(compiled) => Some(compiled),
                    Err(e) => {
                        error!(uri = %self.uri, error = %e, "route pattern failed to compile");
                        None
                    }
                },
            )
            .as_ref()
    }

    /// Whether the route matches the request. `including_method` is false
    /// during the alternate-verb check.
    pub fn matches(&self, request: &Request, including_method: bool) -> bool {
        if including_method && !self.methods.contains(&request.method) {
            return false;
        }
        let Some(compiled) = self.compiled() else {
            return false;
        };
        if let Some(domain_regex) = &compiled.domain_regex {
            match &request.domain {
                Some(domain) if domain_regex.is_match(domain) => {}
                _ => return false,
            }
        }
        compiled.path_regex.is_match(&request.path)
    }

    /// Extract path (and domain) parameters into the request.
    pub fn bind(&self, request: &mut Request) {
        let Some(compiled) = self.compiled() else {
            return;
        };
        if let Some(domain_regex) = &compiled.domain_regex {
            if let Some(domain) = request.domain.clone() {
                if let Some(captures) = domain_regex.captures(&domain) {
                    for name in &compiled.domain_params {
                        if let Some(capture) = captures.name(name) {
                            request
                                .path_params
                                .insert(name.clone(), capture.as_str().to_string());
                        }
                    }
                }
            }
        }
        let path = request.path.clone();
        if let Some(captures) = compiled.path_regex.captures(&path) {
            for name in &compiled.path_params {
                if let Some(capture) = captures.name(name) {
                    request
                        .path_params
                        .insert(name.clone(), capture.as_str().to_string());
                }
            }
        }
    }

    /// Invoke the route's handler.
    pub async fn run(
        &self,
        request: Request,
        controllers: &ControllerRegistry,
    ) -> Result<Response, Error> {
        match &self.action.handler {
            Handler::Closure(handler) => handler(request).await,
            Handler::Named { target, method } => {
                let controller = controllers
                    .get(target)
                    .ok_or_else(|| Error::HandlerResolution(format!("{target}#{method}")))?;
                controller.call(method, request).await
            }
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("methods", &self.methods)
            .field("uri", &self.uri)
            .field("name", &self.action.name)
            .field("domain", &self.action.domain)
            .finish()
    }
}
