//! Consent providers.
//!
//! Consent is obtained per action: the evaluator asks the provider once per
//! node and never caches the answer, since consent may be scoped to a single
//! invocation. A provider that errors or hangs is treated as "no consent" by
//! the evaluator, never as a grant.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Answer from a consent provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentResponse {
    pub has_consent: bool,
}

/// External responder for medium/high-risk actions.
///
/// Implementations typically bridge to a human prompt or a remote policy
/// service; they may block, so the evaluator wraps calls in a deadline.
#[async_trait]
pub trait ConsentProvider: Send + Sync {
    async fn check(&self, tool: &str, input: &Value) -> anyhow::Result<ConsentResponse>;
}

/// Default-deny provider: nothing is ever consented.
///
/// Used when no provider is configured, so that high-risk actions fail closed
/// instead of running unattended.
pub struct DenyAll;

#[async_trait]
impl ConsentProvider for DenyAll {
    async fn check(&self, _tool: &str, _input: &Value) -> anyhow::Result<ConsentResponse> {
        Ok(ConsentResponse { has_consent: false })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsentRecord {
    action: String,
    approved: bool,
    revoked: bool,
    timestamp: DateTime<Utc>,
}

/// In-process consent ledger.
///
/// Records grant/revoke decisions per action name; the most recent non-revoked
/// record wins and absence means deny. Hosts that prompt a human can push the
/// answer into the ledger before (or while) a run executes.
#[derive(Clone, Default)]
pub struct ConsentLedger {
    records: Arc<RwLock<Vec<ConsentRecord>>>,
}

impl ConsentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant(&self, action: impl Into<String>) {
        self.log(action.into(), true).await;
    }

    pub async fn deny(&self, action: impl Into<String>) {
        self.log(action.into(), false).await;
    }

    async fn log(&self, action: String, approved: bool) {
        self.records.write().await.push(ConsentRecord {
            action,
            approved,
            revoked: false,
            timestamp: Utc::now(),
        });
    }

    /// Revoke every standing grant for an action.
    pub async fn revoke(&self, action: &str) {
        let mut records = self.records.write().await;
        for record in records.iter_mut() {
            if record.action == action && record.approved {
                record.revoked = true;
            }
        }
    }

    /// Latest decision for an action; default deny when none exists.
    pub async fn query(&self, action: &str) -> bool {
        let records = self.records.read().await;
        for record in records.iter().rev() {
            if record.action == action {
                return record.approved && !record.revoked;
            }
        }
        false
    }
}

#[async_trait]
impl ConsentProvider for ConsentLedger {
    async fn check(&self, tool: &str, _input: &Value) -> anyhow::Result<ConsentResponse> {
        Ok(ConsentResponse {
            has_consent: self.query(tool).await,
        })
    }
}
