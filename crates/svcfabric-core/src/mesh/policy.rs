//! Traffic policy evaluation (spec.md §4.2.1).
//!
//! Grounded on the teacher's `router` module's ordered-rule matching
//! (first predicate wins), adapted from HTTP-route dispatch to
//! service-mesh traffic shifting.

use std::collections::HashMap;

/// How a rule's `path` predicate compares against the request path.
#[derive(Debug, Clone)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(regex::Regex),
}

impl PathMatch {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(expected) => path == expected,
            PathMatch::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatch::Regex(re) => re.is_match(path),
        }
    }
}

/// Conjunctive match predicate for one [`Rule`] (spec.md §4.2.1).
#[derive(Debug, Clone, Default)]
pub struct Match {
    pub headers: HashMap<String, String>,
    pub path: Option<PathMatch>,
    pub methods: Vec<String>,
    pub source_service: Option<String>,
    pub source_labels: HashMap<String, String>,
}

impl Match {
    pub fn matches(&self, request: &RequestContext) -> bool {
        let headers_ok = self
            .headers
            .iter()
            .all(|(k, v)| request.headers.get(k) == Some(v));
        let path_ok = self.path.as_ref().is_none_or(|p| p.matches(&request.path));
        let method_ok = self.methods.is_empty() || self.methods.iter().any(|m| m == &request.method);
        let source_service_ok = self
            .source_service
            .as_ref()
            .is_none_or(|expected| request.source_service.as_deref() == Some(expected.as_str()));
        let source_labels_ok = self
            .source_labels
            .iter()
            .all(|(k, v)| request.source_labels.get(k) == Some(v));

        headers_ok && path_ok && method_ok && source_service_ok && source_labels_ok
    }
}

/// Minimal request shape traffic policies are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub source_service: Option<String>,
    pub source_labels: HashMap<String, String>,
}

/// The effect of a matched [`Rule`]. `redirect`/`fault`/`delay`/`abort`
/// are contract-only per spec.md §4.2.1 and are not modeled as variants.
#[derive(Debug, Clone)]
pub struct RouteAction {
    pub destination_service: String,
    pub destination_version: Option<String>,
    pub weight: u32,
    pub header_rewrites: HashMap<String, String>,
}

/// One rule within a [`TrafficPolicy`].
#[derive(Debug, Clone)]
pub struct Rule {
    pub m: Match,
    pub action: RouteAction,
}

/// A traffic policy scoped to a service selector, evaluated in priority
/// order against all policies registered for a call.
#[derive(Debug, Clone)]
pub struct TrafficPolicy {
    pub priority: i32,
    pub service_selector: String,
    pub rules: Vec<Rule>,
}

/// Evaluate every policy matching `service_name`, highest priority first;
/// within the winning policy, the first rule whose match holds supplies
/// the action.
pub fn evaluate<'a>(
    policies: &'a [TrafficPolicy],
    service_name: &str,
    request: &RequestContext,
) -> Option<&'a RouteAction> {
    let mut candidates: Vec<&TrafficPolicy> = policies
        .iter()
        .filter(|p| p.service_selector == service_name)
        .collect();
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

    for policy in candidates {
        if let Some(rule) = policy.rules.iter().find(|r| r.m.matches(request)) {
            return Some(&rule.action);
        }
    }
    None
}
