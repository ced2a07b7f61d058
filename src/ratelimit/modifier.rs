//! Request classification: the request context seen by the limiter and the
//! modifiers that add vary dimensions from it.

use std::collections::HashMap;

use super::descriptor::RateLimit;
use crate::error::RateLimitError;

/// What the HTTP layer knows about a request, reduced to what rate limiting
/// can vary on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub method: String,
    /// Name of the matched route
    pub route: Option<String>,
    /// Resolved request attributes (path parameters, tenant id, ...)
    pub attributes: HashMap<String, String>,
    /// Name of the GraphQL operation, if this is a GraphQL request
    pub graphql_operation: Option<String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_graphql_operation(mut self, operation: impl Into<String>) -> Self {
        self.graphql_operation = Some(operation.into());
        self
    }
}

/// Adds one vary dimension to a rate limit when it applies to a request.
pub trait RateLimitModifier: Send + Sync {
    /// Whether this modifier applies to the request.
    fn supports(&self, request: &RequestContext) -> bool;

    /// Add this modifier's dimension to the rate limit.
    fn apply(&self, request: &RequestContext, rate_limit: &mut RateLimit)
        -> Result<(), RateLimitError>;
}

/// Varies on the HTTP method. Applies to every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpMethodModifier;

impl RateLimitModifier for HttpMethodModifier {
    fn supports(&self, _request: &RequestContext) -> bool {
        true
    }

    fn apply(
        &self,
        request: &RequestContext,
        rate_limit: &mut RateLimit,
    ) -> Result<(), RateLimitError> {
        rate_limit.vary_on("http_method", request.method.as_str())
    }
}

/// Varies on a named request attribute, when the request carries it.
#[derive(Debug, Clone)]
pub struct RequestAttributeModifier {
    attribute: String,
}

impl RequestAttributeModifier {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl RateLimitModifier for RequestAttributeModifier {
    fn supports(&self, request: &RequestContext) -> bool {
        request.attributes.contains_key(&self.attribute)
    }

    fn apply(
        &self,
        request: &RequestContext,
        rate_limit: &mut RateLimit,
    ) -> Result<(), RateLimitError> {
        match request.attributes.get(&self.attribute) {
            Some(value) => rate_limit.vary_on(self.attribute.as_str(), value.as_str()),
            None => Ok(()),
        }
    }
}

/// Run every supporting modifier, in order, stopping at the first error.
pub fn apply_modifiers(
    modifiers: &[Box<dyn RateLimitModifier>],
    request: &RequestContext,
    rate_limit: &mut RateLimit,
) -> Result<(), RateLimitError> {
    for modifier in modifiers {
        if modifier.supports(request) {
            modifier.apply(request, rate_limit)?;
        }
    }
    Ok(())
}
