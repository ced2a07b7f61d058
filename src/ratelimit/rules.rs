//! Rate limit rules and request resolution.
//!
//! Rules decide which requests are rate limited and with which limit and
//! period. Three tables are consulted, in order:
//!
//! - GraphQL operations, each on its own counter keyed by operation name.
//! - `routes`, each on its own counter keyed by route name.
//! - `limited_routes`, the routes whose handlers are marked as limited.
//!   With `limit_by_route` each gets its own counter and its declared
//!   limits; without it they all share one counter under the defaults.
//!
//! Resolution produces the `RateLimit` for one request, seeded from the
//! matching table and completed by the registered modifiers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::descriptor::RateLimit;
use super::modifier::{
    apply_modifiers, HttpMethodModifier, RateLimitModifier, RequestAttributeModifier,
    RequestContext,
};
use crate::config::EngineConfig;
use crate::error::RateLimitError;

/// Vary key carrying the route name.
pub const ROUTE_VARY_KEY: &str = "_route";
/// Vary key carrying the GraphQL operation name.
pub const GRAPHQL_VARY_KEY: &str = "_graphql_endpoint";

/// Per-route override of the default limit and period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub period: Option<i64>,
}

/// Rate limit for one GraphQL operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQLEndpoint {
    /// Operation name, as extracted from the query
    pub endpoint: String,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub period: Option<i64>,
}

/// Resolves the rate limit of a request from the configured rules.
pub struct RouteRules {
    default_limit: i64,
    default_period: i64,
    limit_by_route: bool,
    routes: HashMap<String, LimitOverride>,
    limited_routes: HashMap<String, LimitOverride>,
    graphql_endpoints: Vec<GraphQLEndpoint>,
    modifiers: Vec<Box<dyn RateLimitModifier>>,
}

impl RouteRules {
    /// Build rules from configuration. Modifiers are the HTTP method
    /// modifier followed by one attribute modifier per configured attribute.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut modifiers: Vec<Box<dyn RateLimitModifier>> = vec![Box::new(HttpMethodModifier)];
        for attribute in &config.attribute_modifiers {
            modifiers.push(Box::new(RequestAttributeModifier::new(attribute.as_str())));
        }

        Self {
            default_limit: config.limit,
            default_period: config.period,
            limit_by_route: config.limit_by_route,
            routes: config.routes.clone(),
            limited_routes: config.limited_routes.clone(),
            graphql_endpoints: config.graphql_endpoints.clone(),
            modifiers,
        }
    }

    /// Replace the modifier chain.
    pub fn with_modifiers(mut self, modifiers: Vec<Box<dyn RateLimitModifier>>) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// The rate limit for `request`, or `None` if no rule applies.
    pub fn resolve(&self, request: &RequestContext) -> Result<Option<RateLimit>, RateLimitError> {
        let Some(mut rate_limit) = self.seed(request)? else {
            return Ok(None);
        };

        apply_modifiers(&self.modifiers, request, &mut rate_limit)?;

        trace!(
            route = ?request.route,
            operation = ?request.graphql_operation,
            limit = rate_limit.limit(),
            period = rate_limit.period(),
            "Resolved rate limit"
        );

        Ok(Some(rate_limit))
    }

    /// GraphQL operations take precedence over the route they are served on.
    fn seed(&self, request: &RequestContext) -> Result<Option<RateLimit>, RateLimitError> {
        if let Some(operation) = &request.graphql_operation {
            if let Some(endpoint) = self.graphql_endpoints.iter().find(|e| &e.endpoint == operation) {
                let mut rate_limit = RateLimit::new(
                    endpoint.limit.unwrap_or(self.default_limit),
                    endpoint.period.unwrap_or(self.default_period),
                )?;
                rate_limit.vary_on(GRAPHQL_VARY_KEY, operation.as_str())?;
                return Ok(Some(rate_limit));
            }
        }

        let Some(route) = &request.route else {
            return Ok(None);
        };

        if let Some(overrides) = self.routes.get(route) {
            return self.per_route(route, overrides).map(Some);
        }

        match self.limited_routes.get(route) {
            Some(overrides) if self.limit_by_route => self.per_route(route, overrides).map(Some),
            // Every limited route counts against the same window.
            Some(_) => RateLimit::new(self.default_limit, self.default_period).map(Some),
            None => Ok(None),
        }
    }

    fn per_route(&self, route: &str, overrides: &LimitOverride) -> Result<RateLimit, RateLimitError> {
        let mut rate_limit = RateLimit::new(
            overrides.limit.unwrap_or(self.default_limit),
            overrides.period.unwrap_or(self.default_period),
        )?;
        rate_limit.vary_on(ROUTE_VARY_KEY, route)?;
        Ok(rate_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> EngineConfig {
        EngineConfig::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_unlisted_route_is_not_limited() {
        let rules = RouteRules::from_config(&config("routes: {}"));
        let request = RequestContext::new("GET").with_route("home");
        assert!(rules.resolve(&request).unwrap().is_none());
    }

    #[test]
    fn test_request_without_route_is_not_limited() {
        let rules = RouteRules::from_config(&config("limit_by_route: true"));
        assert!(rules.resolve(&RequestContext::new("GET")).unwrap().is_none());
    }

    #[test]
    fn test_route_override() {
        let rules = RouteRules::from_config(&config(
            r#"
limit: 1000
period: 60
routes:
  api_list:
    limit: 5
"#,
        ));
        let request = RequestContext::new("GET").with_route("api_list");

        let rate_limit = rules.resolve(&request).unwrap().unwrap();
        assert_eq!(rate_limit.limit(), 5);
        assert_eq!(rate_limit.period(), 60);
        assert_eq!(
            rate_limit.discriminator().unwrap(),
            r#"{"_route":"api_list","http_method":"GET"}"#
        );
    }

    const LIMITED_ROUTES: &str = r#"
limit: 7
period: 30
limited_routes:
  order_export:
    limit: 1
    period: 3600
  order_import: {}
"#;

    #[test]
    fn test_limited_routes_share_one_counter() {
        let rules = RouteRules::from_config(&config(LIMITED_ROUTES));

        let export = rules
            .resolve(&RequestContext::new("POST").with_route("order_export"))
            .unwrap()
            .unwrap();
        let import = rules
            .resolve(&RequestContext::new("POST").with_route("order_import"))
            .unwrap()
            .unwrap();

        assert_eq!((export.limit(), export.period()), (7, 30));
        assert_eq!(export.discriminator().unwrap(), r#"{"http_method":"POST"}"#);
        assert_eq!(export.hash().unwrap(), import.hash().unwrap());
    }

    #[test]
    fn test_limit_by_route_separates_limited_routes() {
        let rules =
            RouteRules::from_config(&config(&format!("limit_by_route: true\n{}", LIMITED_ROUTES)));

        let export = rules
            .resolve(&RequestContext::new("POST").with_route("order_export"))
            .unwrap()
            .unwrap();
        let import = rules
            .resolve(&RequestContext::new("POST").with_route("order_import"))
            .unwrap()
            .unwrap();

        assert_eq!((export.limit(), export.period()), (1, 3600));
        assert_eq!((import.limit(), import.period()), (7, 30));
        assert_eq!(
            export.discriminator().unwrap(),
            r#"{"_route":"order_export","http_method":"POST"}"#
        );
        assert_ne!(export.hash().unwrap(), import.hash().unwrap());
    }

    #[test]
    fn test_limit_by_route_leaves_unmarked_routes_alone() {
        let rules =
            RouteRules::from_config(&config(&format!("limit_by_route: true\n{}", LIMITED_ROUTES)));
        let request = RequestContext::new("GET").with_route("home");
        assert!(rules.resolve(&request).unwrap().is_none());
    }

    #[test]
    fn test_route_table_ignores_limit_by_route() {
        let yaml = "routes:\n  api_list:\n    limit: 5\nlimited_routes:\n  api_list: {}\n";
        for limit_by_route in [false, true] {
            let rules = RouteRules::from_config(&config(&format!(
                "limit_by_route: {}\n{}",
                limit_by_route, yaml
            )));
            let rate_limit = rules
                .resolve(&RequestContext::new("GET").with_route("api_list"))
                .unwrap()
                .unwrap();

            assert_eq!(rate_limit.limit(), 5);
            assert_eq!(
                rate_limit.discriminator().unwrap(),
                r#"{"_route":"api_list","http_method":"GET"}"#
            );
        }
    }

    #[test]
    fn test_graphql_endpoint() {
        let rules = RouteRules::from_config(&config(
            r#"
period: 60
graphql_endpoints:
  - endpoint: createOrder
    limit: 2
  - endpoint: listOrders
"#,
        ));
        let request = RequestContext::new("POST")
            .with_route("graphql")
            .with_graphql_operation("createOrder");

        let rate_limit = rules.resolve(&request).unwrap().unwrap();
        assert_eq!((rate_limit.limit(), rate_limit.period()), (2, 60));
        assert_eq!(
            rate_limit.discriminator().unwrap(),
            r#"{"_graphql_endpoint":"createOrder","http_method":"POST"}"#
        );
    }

    #[test]
    fn test_unknown_graphql_operation_falls_back_to_route() {
        let rules = RouteRules::from_config(&config(
            r#"
graphql_endpoints:
  - endpoint: createOrder
"#,
        ));
        let request = RequestContext::new("POST")
            .with_route("graphql")
            .with_graphql_operation("other");

        assert!(rules.resolve(&request).unwrap().is_none());
    }

    #[test]
    fn test_attribute_modifiers_from_config() {
        let rules = RouteRules::from_config(&config(
            r#"
routes:
  orders: {}
attribute_modifiers: [tenant]
"#,
        ));
        let request = RequestContext::new("GET")
            .with_route("orders")
            .with_attribute("tenant", "acme");

        let rate_limit = rules.resolve(&request).unwrap().unwrap();
        assert_eq!(
            rate_limit.discriminator().unwrap(),
            r#"{"_route":"orders","http_method":"GET","tenant":"acme"}"#
        );
    }

    #[test]
    fn test_modifier_colliding_with_route_key_fails() {
        let rules = RouteRules::from_config(&config("routes:\n  orders: {}"))
            .with_modifiers(vec![Box::new(RequestAttributeModifier::new(ROUTE_VARY_KEY))]);
        let request = RequestContext::new("GET")
            .with_route("orders")
            .with_attribute(ROUTE_VARY_KEY, "orders");

        assert_eq!(
            rules.resolve(&request).unwrap_err(),
            RateLimitError::DuplicateVaryKey(ROUTE_VARY_KEY.to_string())
        );
    }

    #[test]
    fn test_negative_override_fails() {
        let rules = RouteRules::from_config(&EngineConfig {
            routes: [(
                "bad".to_string(),
                LimitOverride {
                    limit: Some(-1),
                    period: None,
                },
            )]
            .into_iter()
            .collect(),
            ..EngineConfig::default()
        });
        let request = RequestContext::new("GET").with_route("bad");

        assert!(matches!(
            rules.resolve(&request),
            Err(RateLimitError::InvalidRateLimit { .. })
        ));
    }
}
