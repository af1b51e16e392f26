// Error types for the Trellis framework

use crate::http::Method;
use thiserror::Error;
use trellis_events::DispatchError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Method not allowed, supported: {}", format_methods(.allowed))]
    MethodNotAllowed { allowed: Vec<Method> },

    #[error("No binding for route parameter: {0}")]
    BindingNotFound(String),

    #[error("Handler resolution failed: {0}")]
    HandlerResolution(String),

    #[error("Middleware resolution failed: {0}")]
    MiddlewareResolution(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Event dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

fn format_methods(methods: &[Method]) -> String {
    methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::RouteNotFound(_) => 404,
            Error::BindingNotFound(_) => 404,
            Error::MethodNotAllowed { .. } => 405,
            Error::BadRequest(_) => 400,
            Error::Deserialization(_) => 400,
            Error::Timeout(_) => 504,
            Error::HandlerResolution(_)
            | Error::MiddlewareResolution(_)
            | Error::Serialization(_)
            | Error::Internal(_)
            | Error::Dispatch(_) => 500,
        }
    }

    /// The verbs a 405 should advertise in its Allow header
    pub fn allowed_methods(&self) -> Option<&[Method]> {
        match self {
            Error::MethodNotAllowed { allowed } => Some(allowed),
            _ => None,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}
