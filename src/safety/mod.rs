//! Safety evaluation for tool invocations.
//!
//! Every node is gated through a three-step check before its handler runs:
//! static risk classification, domain allow/deny rules against any URLs in the
//! input, and a per-action consent gate for medium/high-risk tools. Decisions
//! are produced fresh per node; the evaluator holds no cache and performs no
//! side effects beyond the consent query.

pub mod consent;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

pub use consent::{ConsentLedger, ConsentProvider, ConsentResponse, DenyAll};

/// Default bound on how long a consent check may block.
pub const DEFAULT_CONSENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Static classification of a tool's potential impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// Risk tier for a tool name. Unknown tools are high risk (fail closed).
pub fn risk_tier(tool: &str) -> RiskTier {
    match tool {
        // Pure reads and internal memory access.
        "scrape_page" | "read_page" | "web_search" | "summarize" | "compare" | "recall_fact"
        | "store_fact" => RiskTier::Low,
        // Tab/window/navigation mutation.
        "open_tab" | "close_tab" | "manage_tabs" | "navigate" | "fill_form" => RiskTier::Medium,
        // Financial or otherwise irreversible actions.
        "submit_form" | "place_order" | "trade_order" | "send_email" | "delete_data" => {
            RiskTier::High
        }
        _ => RiskTier::High,
    }
}

/// Domain allow/deny rules and the consent switch for one run.
///
/// Forwarded verbatim into every node's invocation context so handlers can
/// observe the exact policy they were invoked under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SafetyPolicy {
    /// When non-empty, URL-bearing actions may only target these domains.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_domains: Vec<String>,
    /// URL-bearing actions targeting these domains are always denied.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub denied_domains: Vec<String>,
    /// Require consent for medium-risk tools. High-risk tools always require it.
    pub require_consent: bool,
}

impl SafetyPolicy {
    pub fn deny_domains(mut self, domains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.denied_domains.extend(domains.into_iter().map(Into::into));
        self
    }

    pub fn allow_domains(mut self, domains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_domains.extend(domains.into_iter().map(Into::into));
        self
    }

    pub fn with_consent_required(mut self, required: bool) -> Self {
        self.require_consent = required;
        self
    }
}

/// Outcome of evaluating one `(tool, input, policy)` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyDecision {
    pub allowed: bool,
    pub consent_required: bool,
    pub consent_granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SafetyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            consent_required: false,
            consent_granted: false,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            consent_required: false,
            consent_granted: false,
            reason: Some(reason),
        }
    }
}

/// Gatekeeper consulted once per node before its handler may run.
pub struct SafetyEvaluator {
    consent: Arc<dyn ConsentProvider>,
    consent_timeout: Duration,
}

impl SafetyEvaluator {
    pub fn new(consent: Arc<dyn ConsentProvider>) -> Self {
        Self {
            consent,
            consent_timeout: DEFAULT_CONSENT_TIMEOUT,
        }
    }

    pub fn with_consent_timeout(mut self, timeout: Duration) -> Self {
        self.consent_timeout = timeout;
        self
    }

    /// Decide whether the invocation may proceed.
    ///
    /// Domain denial short-circuits: a denied-domain action is rejected before
    /// any consent prompt. `timeout_override` bounds the consent wait for this
    /// call (callers pass the run-level deadline when one is set).
    pub async fn evaluate(
        &self,
        tool: &str,
        input: &Value,
        policy: &SafetyPolicy,
        timeout_override: Option<Duration>,
    ) -> SafetyDecision {
        let tier = risk_tier(tool);

        if let Some(reason) = domain_violation(input, policy) {
            tracing::warn!(tool, %reason, "action denied by domain policy");
            return SafetyDecision::deny(reason);
        }

        // Low-risk tools never prompt, regardless of the policy switch.
        if tier == RiskTier::Low {
            return SafetyDecision::allow();
        }
        let needs_consent = tier == RiskTier::High || policy.require_consent;
        if !needs_consent {
            return SafetyDecision::allow();
        }

        let deadline = timeout_override.unwrap_or(self.consent_timeout);
        let granted = match tokio::time::timeout(deadline, self.consent.check(tool, input)).await {
            Ok(Ok(response)) => response.has_consent,
            Ok(Err(err)) => {
                tracing::warn!(tool, error = %err, "consent provider failed; treating as denied");
                return SafetyDecision {
                    allowed: false,
                    consent_required: true,
                    consent_granted: false,
                    reason: Some(format!(
                        "Consent check for '{tool}' could not be completed: {err:#}"
                    )),
                };
            }
            Err(_) => {
                tracing::warn!(tool, ?deadline, "consent check timed out; treating as denied");
                return SafetyDecision {
                    allowed: false,
                    consent_required: true,
                    consent_granted: false,
                    reason: Some(format!(
                        "Consent check for '{tool}' timed out after {deadline:?}"
                    )),
                };
            }
        };

        if granted {
            SafetyDecision {
                allowed: true,
                consent_required: true,
                consent_granted: true,
                reason: None,
            }
        } else {
            SafetyDecision {
                allowed: false,
                consent_required: true,
                consent_granted: false,
                reason: Some(format!("Consent was withheld for '{tool}'")),
            }
        }
    }
}

/// First domain-rule violation in the input, if any.
fn domain_violation(input: &Value, policy: &SafetyPolicy) -> Option<String> {
    for host in extract_hosts(input) {
        if policy
            .denied_domains
            .iter()
            .any(|d| domain_matches(&host, d))
        {
            return Some(format!("Domain '{host}' is denied by policy"));
        }
        if !policy.allowed_domains.is_empty()
            && !policy
                .allowed_domains
                .iter()
                .any(|d| domain_matches(&host, d))
        {
            return Some(format!("Domain '{host}' is not in the allowed domains"));
        }
    }
    None
}

/// Hosts of every http(s) URL-shaped string anywhere in the input.
fn extract_hosts(input: &Value) -> Vec<String> {
    let mut hosts = Vec::new();
    collect_hosts(input, &mut hosts);
    hosts
}

fn collect_hosts(value: &Value, hosts: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if looks_like_http_url(s) {
                if let Ok(url) = Url::parse(s) {
                    if matches!(url.scheme(), "http" | "https") {
                        if let Some(host) = url.host_str() {
                            // A fully-qualified host may carry a trailing dot;
                            // it resolves to the same domain.
                            let host = host.trim_end_matches('.');
                            hosts.push(host.to_ascii_lowercase());
                        }
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_hosts(item, hosts);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_hosts(item, hosts);
            }
        }
        _ => {}
    }
}

/// URL schemes are case-insensitive, so the prefix check must be too.
fn looks_like_http_url(s: &str) -> bool {
    s.get(..7).map_or(false, |p| p.eq_ignore_ascii_case("http://"))
        || s.get(..8).map_or(false, |p| p.eq_ignore_ascii_case("https://"))
}

/// Exact host match or parent-domain suffix, case-insensitive.
fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}
