//! Request path classification
//!
//! Rules are evaluated in declaration order. The first matching pattern names
//! the route.

use crate::config::RouteConfig;
use regex::Regex;

#[derive(Debug, Clone)]
struct RouteRule {
    pattern: Regex,
    name: String,
}

/// Ordered, first-match-wins route classifier
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    rules: Vec<RouteRule>,
}

impl RouteMatcher {
    /// Create a matcher without rules
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Compile configured rules, keeping their order
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, regex::Error> {
        routes
            .iter()
            .try_fold(Self::new(), |m, r| m.rule(&r.pattern, r.name.as_str()))
    }

    /// Append a rule
    pub fn rule(mut self, pattern: &str, name: impl Into<String>) -> Result<Self, regex::Error> {
        self.rules.push(RouteRule {
            pattern: Regex::new(pattern)?,
            name: name.into(),
        });
        Ok(self)
    }

    /// Name of the first rule whose pattern matches `path`
    pub fn classify(&self, path: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(path))
            .map(|rule| rule.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}
