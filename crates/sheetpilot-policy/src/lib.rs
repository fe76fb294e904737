use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sheetpilot_protocol::SessionId;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEffect {
    ReadOnly,
    SideEffecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallClassification {
    pub effect: CallEffect,
    pub risk: RiskLevel,
    pub requires_approval: bool,
}

impl CallClassification {
    pub fn is_side_effecting(&self) -> bool {
        self.effect == CallEffect::SideEffecting
    }
}

/// Glob patterns over capability names. `*` matches any run of characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySet {
    pub read_only: Vec<String>,
    pub gated: Vec<String>,
    pub high_risk: Vec<String>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            read_only: ["*/read-*", "*/list-*", "*/get-*", "*/analyze-*", "*/describe-*"]
                .map(str::to_owned)
                .to_vec(),
            gated: ["*/delete-*", "*/remove-*", "*/clear-*"]
                .map(str::to_owned)
                .to_vec(),
            high_risk: Vec::new(),
        }
    }
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn classify(&self, session_id: &SessionId, capability: &str) -> CallClassification;
}

#[derive(Debug, Clone)]
pub struct StaticPolicyEngine {
    policy: PolicySet,
}

impl Default for StaticPolicyEngine {
    fn default() -> Self {
        Self::from_policy_set(&PolicySet::default())
    }
}

impl StaticPolicyEngine {
    pub fn from_policy_set(policy: &PolicySet) -> Self {
        Self {
            policy: policy.clone(),
        }
    }

    fn matches(pattern: &str, actual: &str) -> bool {
        let mut parts = pattern.split('*');
        let Some(head) = parts.next() else {
            return actual.is_empty();
        };
        let Some(mut rest) = actual.strip_prefix(head) else {
            return false;
        };
        let segments: Vec<&str> = parts.collect();
        let Some((last, middle)) = segments.split_last() else {
            // No wildcard at all.
            return rest.is_empty();
        };
        for segment in middle {
            match rest.find(segment) {
                Some(index) => rest = &rest[index + segment.len()..],
                None => return false,
            }
        }
        rest.ends_with(last)
    }

    fn set_contains(set: &[String], capability: &str) -> bool {
        set.iter()
            .any(|pattern| Self::matches(pattern, capability))
    }

    pub fn classify_now(&self, capability: &str) -> CallClassification {
        let effect = if Self::set_contains(&self.policy.read_only, capability) {
            CallEffect::ReadOnly
        } else {
            CallEffect::SideEffecting
        };

        let (risk, requires_approval) = if Self::set_contains(&self.policy.high_risk, capability) {
            (RiskLevel::High, true)
        } else if Self::set_contains(&self.policy.gated, capability) {
            (RiskLevel::Medium, true)
        } else {
            (RiskLevel::Low, false)
        };

        CallClassification {
            effect,
            risk,
            requires_approval,
        }
    }
}

#[async_trait]
impl PolicyEngine for StaticPolicyEngine {
    async fn classify(&self, _session_id: &SessionId, capability: &str) -> CallClassification {
        self.classify_now(capability)
    }
}

/// Default policy with per-session overrides.
#[derive(Debug, Clone)]
pub struct SessionPolicyEngine {
    default: StaticPolicyEngine,
    overrides: Arc<RwLock<HashMap<SessionId, StaticPolicyEngine>>>,
}

impl SessionPolicyEngine {
    pub fn new(default_policy: PolicySet) -> Self {
        Self {
            default: StaticPolicyEngine::from_policy_set(&default_policy),
            overrides: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn set_policy(&self, session_id: &SessionId, policy: &PolicySet) {
        self.overrides.write().await.insert(
            session_id.clone(),
            StaticPolicyEngine::from_policy_set(policy),
        );
    }

    pub async fn clear_policy(&self, session_id: &SessionId) -> bool {
        self.overrides.write().await.remove(session_id).is_some()
    }
}

#[async_trait]
impl PolicyEngine for SessionPolicyEngine {
    async fn classify(&self, session_id: &SessionId, capability: &str) -> CallClassification {
        match self.overrides.read().await.get(session_id) {
            Some(engine) => engine.classify_now(capability),
            None => self.default.classify_now(capability),
        }
    }
}
