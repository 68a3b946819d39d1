//! WorkspaceManager - Thread-safe registry of open workspaces
//!
//! Each `Workspace` owns the current pipeline (swapped atomically when the
//! model is upgraded) and the handles of the sessions bound to it, which is
//! what broadcast fans out over.
//!
//! # Usage
//!
//! ```
//! use txsync::workspace_manager::{WorkspaceManager, WorkspaceOptions};
//!
//! let manager = WorkspaceManager::new(WorkspaceOptions::default());
//! manager.create_workspace("acme", Vec::new()).unwrap();
//!
//! let ws = manager.get("acme").unwrap();
//! assert_eq!(ws.session_count(), 0);
//! manager.remove("acme").unwrap();
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::Response;
use crate::error::{Result, SyncError};
use crate::middleware::{
    Identity, Middleware, ModelMiddleware, PluginConfigurationGuard, PrivateDomainGuard, Trigger,
    TriggersMiddleware, TxOriginGuard,
};
use crate::model::{core_model, domains, Domain, Tx};
use crate::pipeline::{BroadcastPlan, Pipeline, PipelineContext};
use crate::session::{
    compact_broadcast, AccountDirectory, AccountResolver, HelloParams, SessionStats, Socket,
    DEFAULT_BROADCAST_THRESHOLD,
};
use crate::storage::{AdapterRegistry, MemoryAdapter};

/// Lets the migration side reach live sessions without owning the registry
pub trait TransactorControl: Send + Sync {
    /// Ask every session of `workspace` to reconnect. Returns how many were closed.
    fn force_close(&self, workspace: &str) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceOptions {
    pub broadcast_threshold: usize,
    pub private_domains: Vec<Domain>,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            broadcast_threshold: DEFAULT_BROADCAST_THRESHOLD,
            private_domains: vec![domains::PREFERENCE.to_string()],
        }
    }
}

/// Assembles the middleware chain for a workspace
#[derive(Clone)]
pub struct PipelineBuilder {
    pub adapters: AdapterRegistry,
    pub private_domains: Vec<Domain>,
    pub triggers: Vec<Trigger>,
}

impl PipelineBuilder {
    pub fn new(adapters: AdapterRegistry) -> Self {
        Self {
            adapters,
            private_domains: vec![domains::PREFERENCE.to_string()],
            triggers: Vec::new(),
        }
    }

    pub fn with_private_domains(mut self, domains: Vec<Domain>) -> Self {
        self.private_domains = domains;
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Guards first, then the model check, then triggers; the store terminates
    /// the chain.
    pub fn build(&self, workspace: &str, model_txes: Vec<Tx>) -> Pipeline {
        let context = Arc::new(PipelineContext::new(workspace, model_txes, self.adapters.clone()));
        let middlewares: Vec<Box<dyn Middleware>> = vec![
            Box::new(TxOriginGuard::new()),
            Box::new(PluginConfigurationGuard::new()),
            Box::new(PrivateDomainGuard::new(self.private_domains.iter().cloned())),
            Box::new(ModelMiddleware::new()),
            Box::new(TriggersMiddleware::new(self.triggers.clone())),
        ];
        Pipeline::new(context, middlewares)
    }
}

/// What a workspace knows about a bound session
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub identity: Identity,
    pub socket: Arc<dyn Socket>,
    pub stats: Arc<SessionStats>,
}

pub struct Workspace {
    name: String,
    builder: PipelineBuilder,
    pipeline: RwLock<Arc<Pipeline>>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    broadcast_threshold: usize,
}

impl Workspace {
    pub fn new(name: &str, builder: PipelineBuilder, model_txes: Vec<Tx>, broadcast_threshold: usize) -> Self {
        let pipeline = Arc::new(builder.build(name, model_txes));
        Self {
            name: name.to_string(),
            builder,
            pipeline: RwLock::new(pipeline),
            sessions: RwLock::new(HashMap::new()),
            broadcast_threshold,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline.read())
    }

    /// Build a fresh pipeline over `model_txes` and make it current.
    ///
    /// Sessions pick it up on their next call; calls already running finish
    /// on the old one.
    pub fn rebuild_pipeline(&self, model_txes: Vec<Tx>) -> Arc<Pipeline> {
        let pipeline = Arc::new(self.builder.build(&self.name, model_txes));
        let old = std::mem::replace(&mut *self.pipeline.write(), Arc::clone(&pipeline));
        info!(
            workspace = %self.name,
            old = old.instance_id(),
            new = pipeline.instance_id(),
            "pipeline rebuilt"
        );
        pipeline
    }

    pub fn register(&self, handle: SessionHandle) {
        debug!(workspace = %self.name, session = %handle.id, "session registered");
        self.sessions.write().insert(handle.id.clone(), handle);
    }

    pub fn unregister(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_in_use(&self) -> bool {
        self.session_count() > 0
    }

    pub fn broadcast_threshold(&self) -> usize {
        self.broadcast_threshold
    }

    /// Documents of `domain` belong to their creators
    pub fn is_private_domain(&self, domain: &str) -> bool {
        self.builder.private_domains.iter().any(|d| d == domain)
    }

    /// Deliver `plan` to every bound session except `exclude`; each session
    /// gets only the entries it may see. Returns the number of sessions
    /// that received something.
    pub fn broadcast(&self, plan: &BroadcastPlan, exclude: Option<&str>) -> usize {
        let sessions = self.sessions.read();
        let mut reached = 0;
        for handle in sessions.values() {
            if exclude == Some(handle.id.as_str()) {
                continue;
            }
            let visible = plan.visible_to(&handle.identity);
            if visible.is_empty() {
                continue;
            }
            let txes = compact_broadcast(visible, self.broadcast_threshold);
            let payload = match serde_json::to_value(&txes) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(workspace = %self.name, error = %e, "broadcast not serializable");
                    return reached;
                }
            };
            match handle.socket.send(&Response::broadcast(payload)) {
                Ok(()) => reached += 1,
                Err(e) => debug!(workspace = %self.name, session = %handle.id, error = %e, "broadcast dropped"),
            }
        }
        reached
    }

    /// Tell every session to reconnect and drop them.
    pub fn force_close(&self) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.write().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            let terminate = Response {
                terminate: Some(true),
                ..Default::default()
            };
            if let Err(e) = handle.socket.send(&terminate) {
                debug!(workspace = %self.name, session = %handle.id, error = %e, "terminate not delivered");
            }
            handle.socket.close();
        }
        if !handles.is_empty() {
            info!(workspace = %self.name, sessions = handles.len(), "sessions force-closed");
        }
        handles.len()
    }

    pub fn roll_over_statistics(&self) {
        for handle in self.sessions.read().values() {
            handle.stats.roll_over();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub name: String,
    pub sessions: usize,
    pub model_size: usize,
    pub pipeline_instance: u64,
}

pub struct WorkspaceManager {
    workspaces: RwLock<HashMap<String, Arc<Workspace>>>,
    options: WorkspaceOptions,
    accounts: Arc<dyn AccountResolver>,
}

impl WorkspaceManager {
    /// Manager with an open account directory: plain users without tokens,
    /// no elevated identities until tokens are configured.
    pub fn new(options: WorkspaceOptions) -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
            options,
            accounts: Arc::new(AccountDirectory::open()),
        }
    }

    pub fn with_account_resolver(mut self, accounts: Arc<dyn AccountResolver>) -> Self {
        self.accounts = accounts;
        self
    }

    pub fn options(&self) -> &WorkspaceOptions {
        &self.options
    }

    /// Identity a `hello` is bound to
    pub fn resolve_account(&self, hello: &HelloParams) -> Result<Identity> {
        self.accounts.resolve(hello)
    }

    /// Allowed characters: [a-zA-Z0-9_-], 1-128 of them
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > 128 {
            return Err(SyncError::InvalidWorkspaceName(
                "Name must be 1-128 characters".to_string(),
            ));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(SyncError::InvalidWorkspaceName(
                "Name can only contain a-z, A-Z, 0-9, _, -".to_string(),
            ));
        }
        Ok(())
    }

    /// Open a workspace over a fresh in-memory store, seeded with the core
    /// model followed by `model`.
    pub fn create_workspace(&self, name: &str, model: Vec<Tx>) -> Result<Arc<Workspace>> {
        let builder = PipelineBuilder::new(AdapterRegistry::new(Arc::new(MemoryAdapter::new())))
            .with_private_domains(self.options.private_domains.clone());
        let mut txes = core_model();
        txes.extend(model);
        self.open_workspace(name, builder, txes)
    }

    /// Register a workspace with a caller-assembled pipeline.
    pub fn open_workspace(&self, name: &str, builder: PipelineBuilder, model_txes: Vec<Tx>) -> Result<Arc<Workspace>> {
        Self::validate_name(name)?;

        let mut workspaces = self.workspaces.write();
        if workspaces.contains_key(name) {
            return Err(SyncError::WorkspaceExists(name.to_string()));
        }
        let workspace = Arc::new(Workspace::new(
            name,
            builder,
            model_txes,
            self.options.broadcast_threshold,
        ));
        workspaces.insert(name.to_string(), Arc::clone(&workspace));
        info!(workspace = name, "workspace opened");
        Ok(workspace)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Workspace>> {
        self.workspaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::WorkspaceNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.workspaces.read().contains_key(name)
    }

    /// Drop a workspace; refused while sessions are bound to it.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut workspaces = self.workspaces.write();
        let ws = workspaces
            .get(name)
            .ok_or_else(|| SyncError::WorkspaceNotFound(name.to_string()))?;
        if ws.is_in_use() {
            return Err(SyncError::WorkspaceInUse(name.to_string()));
        }
        workspaces.remove(name);
        info!(workspace = name, "workspace removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<WorkspaceInfo> {
        let mut infos: Vec<WorkspaceInfo> = self
            .workspaces
            .read()
            .values()
            .map(|ws| {
                let pipeline = ws.pipeline();
                let model_size = pipeline.context().model.read().len();
                WorkspaceInfo {
                    name: ws.name.clone(),
                    sessions: ws.session_count(),
                    model_size,
                    pipeline_instance: pipeline.instance_id(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn roll_over_statistics(&self) {
        for ws in self.workspaces.read().values() {
            ws.roll_over_statistics();
        }
    }

    /// Force-close every session of every workspace. Returns sessions closed.
    pub fn shutdown(&self) -> usize {
        let workspaces: Vec<Arc<Workspace>> = self.workspaces.read().values().cloned().collect();
        workspaces.iter().map(|ws| ws.force_close()).sum()
    }
}

impl TransactorControl for WorkspaceManager {
    fn force_close(&self, workspace: &str) -> Result<usize> {
        Ok(self.get(workspace)?.force_close())
    }
}

#[cfg(test)]
mod workspace_manager_tests {
    use super::*;
    use crate::model::{AccountRole, TxFactory};
    use crate::session::{socket, ChannelSocket};
    use crossbeam_channel::Receiver;
    use crate::session::Outbound;

    fn handle(id: &str, account: &str) -> (SessionHandle, Receiver<Outbound>) {
        let (socket, rx) = ChannelSocket::new(id);
        (
            SessionHandle {
                id: id.to_string(),
                identity: Identity::new(account, AccountRole::User),
                socket: Arc::new(socket),
                stats: Arc::new(SessionStats::new()),
            },
            rx,
        )
    }

    #[test]
    fn test_validate_name() {
        let m = WorkspaceManager::new(WorkspaceOptions::default());
        assert!(m.create_workspace("", Vec::new()).is_err());
        assert!(m.create_workspace(&"a".repeat(129), Vec::new()).is_err());
        assert!(matches!(
            m.create_workspace("bad name", Vec::new()),
            Err(SyncError::InvalidWorkspaceName(_))
        ));
        assert!(m.create_workspace("ok_name-1", Vec::new()).is_ok());
    }

    #[test]
    fn test_create_twice_fails() {
        let m = WorkspaceManager::new(WorkspaceOptions::default());
        m.create_workspace("ws", Vec::new()).unwrap();
        assert!(matches!(m.create_workspace("ws", Vec::new()), Err(SyncError::WorkspaceExists(_))));
        assert!(m.exists("ws"));
        assert!(matches!(m.get("nope"), Err(SyncError::WorkspaceNotFound(_))));
    }

    #[test]
    fn test_remove_refused_while_in_use() {
        let m = WorkspaceManager::new(WorkspaceOptions::default());
        let ws = m.create_workspace("ws", Vec::new()).unwrap();
        let (h, _rx) = handle("s1", "alice");
        ws.register(h);

        assert!(matches!(m.remove("ws"), Err(SyncError::WorkspaceInUse(_))));
        ws.unregister("s1");
        m.remove("ws").unwrap();
        assert!(!m.exists("ws"));
    }

    #[test]
    fn test_broadcast_skips_excluded_session() {
        let m = WorkspaceManager::new(WorkspaceOptions::default());
        let ws = m.create_workspace("ws", Vec::new()).unwrap();
        let (a, a_rx) = handle("s1", "alice");
        let (b, b_rx) = handle("s2", "bob");
        ws.register(a);
        ws.register(b);

        let plan = BroadcastPlan::new(vec![TxFactory::new("alice").remove_doc("c", "s", "1")]);
        assert_eq!(ws.broadcast(&plan, Some("s1")), 1);
        assert!(socket::drain_responses(&a_rx, false).unwrap().is_empty());
        assert_eq!(socket::drain_responses(&b_rx, false).unwrap().len(), 1);
    }

    #[test]
    fn test_force_close_sends_terminate() {
        let m = WorkspaceManager::new(WorkspaceOptions::default());
        let ws = m.create_workspace("ws", Vec::new()).unwrap();
        let (a, rx) = handle("s1", "alice");
        ws.register(a);

        assert_eq!(TransactorControl::force_close(&m, "ws").unwrap(), 1);
        let responses = socket::drain_responses(&rx, false).unwrap();
        assert_eq!(responses[0].terminate, Some(true));
        assert_eq!(ws.session_count(), 0);
        assert!(TransactorControl::force_close(&m, "missing").is_err());
    }

    #[test]
    fn test_rebuild_changes_instance() {
        let m = WorkspaceManager::new(WorkspaceOptions::default());
        let ws = m.create_workspace("ws", Vec::new()).unwrap();
        let before = ws.pipeline().instance_id();
        let txes = ws.pipeline().context().model.read().txes().to_vec();
        let after = ws.rebuild_pipeline(txes).instance_id();
        assert_ne!(before, after);
        assert_eq!(m.list()[0].pipeline_instance, after);
    }
}
