//! Two-phase approval around a generative call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sheetpilot_protocol::{ApprovalKind, ApprovalOutcome, ApprovalRequest, CoreResult, Priority};
use tracing::{debug, instrument};

use crate::gate::ApprovalGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStage {
    Request,
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SamplingOutcome {
    /// Both phases approved. Either payload may carry human modifications.
    Completed { request: Value, result: Value },
    Rejected {
        stage: SamplingStage,
        outcome: ApprovalOutcome,
    },
}

/// Approve the proposed call, run it, then approve its result.
#[derive(Debug, Clone)]
pub struct SamplingFlow {
    gate: Arc<ApprovalGate>,
    model_hint: Option<String>,
    priority: Option<Priority>,
    timeout: Option<Duration>,
}

impl SamplingFlow {
    pub fn new(gate: Arc<ApprovalGate>) -> Self {
        Self {
            gate,
            model_hint: None,
            priority: None,
            timeout: None,
        }
    }

    pub fn with_model_hint(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn request(&self, kind: ApprovalKind, title: &str, payload: Value) -> ApprovalRequest {
        let mut request = ApprovalRequest::new(kind, title, payload);
        request.model_hint = self.model_hint.clone();
        request.priority = self.priority;
        request
    }

    /// `generate` receives the approved (possibly modified) request payload.
    #[instrument(skip(self, request, generate), fields(model = ?self.model_hint))]
    pub async fn run<F, Fut>(&self, request: Value, generate: F) -> CoreResult<SamplingOutcome>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = CoreResult<Value>>,
    {
        let outcome = self
            .gate
            .request_approval(
                self.request(ApprovalKind::SamplingRequest, "Approve sampling request", request),
                self.timeout,
            )
            .await;
        let Some(approved_request) = outcome.payload().cloned() else {
            debug!(outcome = outcome.label(), "sampling request rejected");
            return Ok(SamplingOutcome::Rejected {
                stage: SamplingStage::Request,
                outcome,
            });
        };

        let generated = generate(approved_request.clone()).await?;

        let outcome = self
            .gate
            .request_approval(
                self.request(ApprovalKind::SamplingResult, "Approve sampling result", generated),
                self.timeout,
            )
            .await;
        match outcome.payload().cloned() {
            Some(result) => Ok(SamplingOutcome::Completed {
                request: approved_request,
                result,
            }),
            None => {
                debug!(outcome = outcome.label(), "sampling result rejected");
                Ok(SamplingOutcome::Rejected {
                    stage: SamplingStage::Result,
                    outcome,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::gate::GateConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use sheetpilot_protocol::{ApprovalResponse, ApprovalSurface, ApprovalTicket, CoreError};

    /// Approves requests with an edit; denies results.
    struct EditThenDeny {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl ApprovalSurface for EditThenDeny {
        async fn present(&self, ticket: ApprovalTicket) -> CoreResult<ApprovalResponse> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(match ticket.request.kind {
                ApprovalKind::SamplingRequest => {
                    ApprovalResponse::approve_with(json!({ "prompt": "edited" }))
                }
                _ => ApprovalResponse::deny("hallucinated"),
            })
        }
    }

    struct ApproveAll;

    #[async_trait]
    impl ApprovalSurface for ApproveAll {
        async fn present(&self, _ticket: ApprovalTicket) -> CoreResult<ApprovalResponse> {
            Ok(ApprovalResponse::approve())
        }
    }

    #[tokio::test]
    async fn generator_sees_modified_request_and_result_can_be_rejected() -> anyhow::Result<()> {
        let surface = Arc::new(EditThenDeny {
            seen: AtomicUsize::new(0),
        });
        let gate = Arc::new(ApprovalGate::new(GateConfig::default()).with_surface(surface.clone()));
        let flow = SamplingFlow::new(gate).with_model_hint("small");

        let outcome = flow
            .run(json!({ "prompt": "original" }), |request| async move {
                assert_eq!(request, json!({ "prompt": "edited" }));
                Ok::<_, CoreError>(json!({ "text": "answer" }))
            })
            .await?;

        assert!(matches!(
            outcome,
            SamplingOutcome::Rejected { stage: SamplingStage::Result, .. }
        ));
        assert_eq!(surface.seen.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn approved_flow_completes() -> anyhow::Result<()> {
        let gate = Arc::new(ApprovalGate::new(GateConfig::default()).with_surface(Arc::new(ApproveAll)));
        let outcome = SamplingFlow::new(gate)
            .run(json!({ "prompt": "p" }), |_| async { Ok::<_, CoreError>(json!("r")) })
            .await?;
        assert_eq!(
            outcome,
            SamplingOutcome::Completed {
                request: json!({ "prompt": "p" }),
                result: json!("r"),
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejected_request_never_generates() -> anyhow::Result<()> {
        let gate = Arc::new(ApprovalGate::new(GateConfig::default()));
        let outcome = SamplingFlow::new(gate)
            .with_timeout(Duration::ZERO)
            .run(json!({}), |_| async {
                Err::<Value, _>(CoreError::Internal("generator must not run".into()))
            })
            .await?;
        assert!(matches!(
            outcome,
            SamplingOutcome::Rejected { stage: SamplingStage::Request, .. }
        ));
        Ok(())
    }
}
