use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use sheetpilot_approval::{ApprovalGate, ApprovalMode};
use sheetpilot_events::NotificationBus;
use sheetpilot_ledger::{InverseRules, LedgerSnapshot, OperationLedger};
use sheetpilot_policy::{PolicySet, SessionPolicyEngine};
use sheetpilot_protocol::{
    ApprovalSurface, CoreError, CoreResult, KeyValueStore, SessionId, ToolBackend,
};
use sheetpilot_store::{FileKeyValueStore, PersistQueue};
use sheetpilot_tools::ToolDispatcher;
use tracing::{info, instrument, warn};

use crate::config::KernelConfig;
use crate::context::{SessionContext, ledger_key};

type RulesFactory = Arc<dyn Fn() -> InverseRules + Send + Sync>;

#[derive(Clone)]
pub struct KernelBuilder {
    config: KernelConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    surface: Option<Arc<dyn ApprovalSurface>>,
    backends: Vec<Arc<dyn ToolBackend>>,
    inverse_rules: Option<RulesFactory>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            store: None,
            surface: None,
            backends: Vec::new(),
            inverse_rules: None,
        }
    }

    /// Overrides the file store configured under `persistence.root`.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn approval_surface(mut self, surface: Arc<dyn ApprovalSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.config.approvals.mode = mode;
        self
    }

    pub fn default_policy(mut self, policy: PolicySet) -> Self {
        self.config.policy = policy;
        self
    }

    /// Registered into every new session.
    pub fn backend(mut self, backend: Arc<dyn ToolBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Custom inverse rules for every session's ledger.
    pub fn inverse_rules<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> InverseRules + Send + Sync + 'static,
    {
        self.inverse_rules = Some(Arc::new(factory));
        self
    }

    /// Spawns the persist queue, so it must run inside a tokio runtime.
    pub fn build(self) -> Kernel {
        let store = self.store.or_else(|| {
            self.config
                .persistence
                .root
                .clone()
                .map(|root| Arc::new(FileKeyValueStore::new(root)) as Arc<dyn KeyValueStore>)
        });
        let persist = store
            .as_ref()
            .map(|store| Arc::new(PersistQueue::spawn(store.clone(), self.config.persistence.queue)));
        let policy = Arc::new(SessionPolicyEngine::new(self.config.policy.clone()));

        Kernel {
            config: self.config,
            policy,
            store,
            persist,
            surface: self.surface,
            backends: self.backends,
            inverse_rules: self.inverse_rules,
            sessions: Arc::new(RwLock::new(IndexMap::new())),
        }
    }
}

/// Composes and owns the session contexts.
#[derive(Clone)]
pub struct Kernel {
    config: KernelConfig,
    policy: Arc<SessionPolicyEngine>,
    store: Option<Arc<dyn KeyValueStore>>,
    persist: Option<Arc<PersistQueue>>,
    surface: Option<Arc<dyn ApprovalSurface>>,
    backends: Vec<Arc<dyn ToolBackend>>,
    inverse_rules: Option<RulesFactory>,
    sessions: Arc<RwLock<IndexMap<SessionId, Arc<SessionContext>>>>,
}

impl Kernel {
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn policy(&self) -> Arc<SessionPolicyEngine> {
        self.policy.clone()
    }

    pub async fn create_session(&self) -> CoreResult<Arc<SessionContext>> {
        self.open_session(SessionId::generate()).await
    }

    /// Open (or return) the session with this id, restoring its ledger from
    /// the store when a snapshot exists.
    #[instrument(skip(self), fields(%session_id))]
    pub async fn open_session(&self, session_id: SessionId) -> CoreResult<Arc<SessionContext>> {
        if let Some(existing) = self.session(&session_id) {
            return Ok(existing);
        }

        let rules = self
            .inverse_rules
            .as_ref()
            .map(|factory| factory())
            .unwrap_or_default();
        let ledger = match self.load_snapshot(&session_id).await? {
            Some(snapshot) => {
                info!(operations = snapshot.operations.len(), "ledger restored");
                OperationLedger::from_snapshot(self.config.ledger, rules, snapshot)
            }
            None => OperationLedger::with_rules(self.config.ledger, rules),
        };

        let mut gate = ApprovalGate::new(self.config.approvals.clone());
        if let Some(surface) = &self.surface {
            gate = gate.with_surface(surface.clone());
        }
        let dispatcher = ToolDispatcher::new(
            self.policy.clone(),
            Arc::new(ledger),
            Arc::new(NotificationBus::new(self.config.notifications)),
            Arc::new(gate),
        )
        .with_session(session_id.clone());

        let context = Arc::new(SessionContext::new(dispatcher, self.persist.clone()));
        for backend in &self.backends {
            context.register_backend(backend.clone()).await?;
        }

        let mut sessions = self.sessions.write();
        let context = sessions
            .entry(session_id)
            .or_insert(context)
            .clone();
        info!(sessions = sessions.len(), "session opened");
        Ok(context)
    }

    async fn load_snapshot(&self, session_id: &SessionId) -> CoreResult<Option<LedgerSnapshot>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(value) = store.get(&ledger_key(session_id)).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|error| CoreError::Storage(format!("corrupt ledger snapshot: {error}")))
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Arc<SessionContext>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn close_session(&self, session_id: &SessionId) -> bool {
        let removed = self.sessions.write().shift_remove(session_id);
        if let Some(context) = &removed {
            for ticket in context.pending_approvals() {
                context.cancel_approval(&ticket.approval_id, "session closed");
            }
            info!(%session_id, "session closed");
        }
        removed.is_some()
    }

    /// Wait until every enqueued ledger snapshot is written.
    pub async fn flush(&self) {
        if let Some(queue) = &self.persist
            && let Err(error) = queue.flush().await
        {
            warn!(%error, "persist queue flush failed");
        }
    }
}
