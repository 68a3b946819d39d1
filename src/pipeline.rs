//! Pipeline: shared workspace context plus the assembled middleware chain
//!
//! A `Pipeline` is built once per workspace (and rebuilt after an upgrade).
//! Sessions hold an `Arc<Pipeline>` and pass a per-call `SessionContext`
//! through it. The context collects what the call produced besides its
//! direct result: transactions to broadcast, deferred follow-up tasks and
//! broadcast filters.

use std::collections::BTreeSet;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::middleware::{store, Identity, Middleware};
use crate::model::{
    Doc, Domain, DocumentQuery, FindOptions, FindResult, Hierarchy, LoadModelResponse, ModelDb,
    Ref, SearchOptions, SearchQuery, SearchResult, Timestamp, Tx,
};
use crate::storage::{AdapterRegistry, StoreAdapter, TxResult};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-workspace state shared by every session
pub struct PipelineContext {
    pub workspace: String,
    pub hierarchy: RwLock<Hierarchy>,
    pub model: RwLock<ModelDb>,
    pub adapters: AdapterRegistry,
}

impl PipelineContext {
    pub fn new(workspace: &str, model_txes: Vec<Tx>, adapters: AdapterRegistry) -> Self {
        let hierarchy = Hierarchy::from_txes(&model_txes);
        Self {
            workspace: workspace.to_string(),
            hierarchy: RwLock::new(hierarchy),
            model: RwLock::new(ModelDb::from_txes(model_txes)),
            adapters,
        }
    }

    pub fn domain_of(&self, class: &str) -> Result<Domain> {
        self.hierarchy.read().get_domain(class)
    }

    pub fn adapter(&self, domain: &str) -> &Arc<dyn StoreAdapter> {
        self.adapters.get(domain)
    }

    /// Append accepted model transactions to the hierarchy and model
    /// database. Returns how many were new.
    pub fn append_model<'t>(&self, txes: impl IntoIterator<Item = &'t Tx>) -> usize {
        let mut hierarchy = self.hierarchy.write();
        let mut model = self.model.write();
        let mut added = 0;
        for tx in txes {
            if model.add(tx.clone()) {
                hierarchy.tx(tx);
                added += 1;
            }
        }
        if added > 0 {
            debug!(workspace = %self.workspace, added, hash = %model.hash(), "model updated");
        }
        added
    }
}

/// Follow-up work queued during a call, run after the caller got its result
pub struct DeferredTask {
    pub name: String,
    run: Box<dyn FnOnce(&mut SessionContext, &Pipeline) -> Result<()> + Send>,
}

impl DeferredTask {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(&mut SessionContext, &Pipeline) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn run(self, ctx: &mut SessionContext, pipeline: &Pipeline) -> Result<()> {
        (self.run)(ctx, pipeline)
    }
}

impl std::fmt::Debug for DeferredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTask").field("name", &self.name).finish()
    }
}

/// Restricts broadcast of one object's transactions to a set of accounts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastFilter {
    pub domain: Domain,
    pub object_id: Ref,
    pub targets: BTreeSet<Ref>,
}

/// One transaction to broadcast; `targets: None` means every session
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEntry {
    pub tx: Tx,
    pub targets: Option<BTreeSet<Ref>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastPlan {
    pub entries: Vec<BroadcastEntry>,
}

impl BroadcastPlan {
    pub fn new(txes: Vec<Tx>) -> Self {
        Self {
            entries: txes
                .into_iter()
                .map(|tx| BroadcastEntry { tx, targets: None })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries visible to `identity`, in order
    pub fn visible_to(&self, identity: &Identity) -> Vec<Tx> {
        self.entries
            .iter()
            .filter(|e| match &e.targets {
                None => true,
                Some(targets) => targets.iter().any(|t| identity.matches(t)),
            })
            .map(|e| e.tx.clone())
            .collect()
    }
}

/// Per-call state threaded through the chain
#[derive(Debug)]
pub struct SessionContext {
    pub workspace: String,
    pub identity: Identity,
    pub session_id: Option<String>,
    /// Distinguishes a request's own effects from its follow-ups
    pub correlation_id: String,
    /// Applied transactions, in order, to be broadcast
    pub derived: Vec<Tx>,
    pub deferred: Vec<DeferredTask>,
    pub broadcast_filters: Vec<BroadcastFilter>,
}

impl SessionContext {
    pub fn new(workspace: &str, identity: Identity) -> Self {
        Self {
            workspace: workspace.to_string(),
            identity,
            session_id: None,
            correlation_id: crate::model::generate_id(),
            derived: Vec::new(),
            deferred: Vec::new(),
            broadcast_filters: Vec::new(),
        }
    }

    pub fn system(workspace: &str) -> Self {
        Self::new(workspace, Identity::system())
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Context for follow-up work: system identity, same session, new
    /// correlation id, empty accumulators.
    pub fn follow_up(&self) -> Self {
        Self {
            workspace: self.workspace.clone(),
            identity: Identity::system(),
            session_id: self.session_id.clone(),
            correlation_id: crate::model::generate_id(),
            derived: Vec::new(),
            deferred: Vec::new(),
            broadcast_filters: Vec::new(),
        }
    }
}

/// Result of a mutating call plus what it left behind
#[derive(Debug)]
pub struct Outcome<T> {
    pub result: T,
    pub derived: Vec<Tx>,
    pub deferred: Vec<DeferredTask>,
}

pub type TxOutcome = Outcome<TxResult>;

/// Cursor over the remainder of the chain
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Box<dyn Middleware>],
    context: &'a PipelineContext,
}

impl<'a> Next<'a> {
    pub fn context(&self) -> &'a PipelineContext {
        self.context
    }

    fn split(&self) -> Option<(&'a dyn Middleware, Next<'a>)> {
        let (head, tail) = self.rest.split_first()?;
        Some((
            head.as_ref(),
            Next {
                rest: tail,
                context: self.context,
            },
        ))
    }

    pub fn tx(self, ctx: &mut SessionContext, tx: &Tx) -> Result<TxResult> {
        match self.split() {
            Some((m, next)) => m.tx(ctx, tx, next),
            None => store::tx(self.context, ctx, tx),
        }
    }

    pub fn find_all(
        self,
        ctx: &mut SessionContext,
        class: &str,
        query: &DocumentQuery,
        options: &FindOptions,
    ) -> Result<FindResult<Doc>> {
        match self.split() {
            Some((m, next)) => m.find_all(ctx, class, query, options, next),
            None => store::find_all(self.context, class, query, options),
        }
    }

    pub fn search_fulltext(
        self,
        ctx: &mut SessionContext,
        query: &SearchQuery,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        match self.split() {
            Some((m, next)) => m.search_fulltext(ctx, query, options, next),
            None => store::search_fulltext(self.context, query, options),
        }
    }

    pub fn domain_request(self, ctx: &mut SessionContext, domain: &str, params: &Value) -> Result<Value> {
        match self.split() {
            Some((m, next)) => m.domain_request(ctx, domain, params, next),
            None => store::domain_request(self.context, domain, params),
        }
    }
}

pub struct Pipeline {
    instance_id: u64,
    context: Arc<PipelineContext>,
    middlewares: Vec<Box<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(context: Arc<PipelineContext>, middlewares: Vec<Box<dyn Middleware>>) -> Self {
        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::SeqCst);
        debug!(
            workspace = %context.workspace,
            instance_id,
            middlewares = ?middlewares.iter().map(|m| m.name()).collect::<Vec<_>>(),
            "pipeline created"
        );
        Self {
            instance_id,
            context,
            middlewares,
        }
    }

    /// Unique per constructed pipeline; changes when a workspace is rebuilt
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    pub fn workspace(&self) -> &str {
        &self.context.workspace
    }

    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    fn head(&self) -> Next<'_> {
        Next {
            rest: &self.middlewares,
            context: &self.context,
        }
    }

    /// Run a tx through the chain, leaving its effects in `ctx`.
    pub fn apply(&self, ctx: &mut SessionContext, tx: &Tx) -> Result<TxResult> {
        self.head().tx(ctx, tx)
    }

    /// Run a tx and hand back everything it produced.
    ///
    /// On error nothing is returned for broadcast: a rejected call leaves no
    /// derived transactions or deferred tasks behind.
    pub fn submit(&self, ctx: &mut SessionContext, tx: &Tx) -> Result<TxOutcome> {
        match self.apply(ctx, tx) {
            Ok(result) => Ok(Self::drain(ctx, result)),
            Err(e) => {
                ctx.derived.clear();
                ctx.deferred.clear();
                Err(e)
            }
        }
    }

    pub fn find_all(
        &self,
        ctx: &mut SessionContext,
        class: &str,
        query: &DocumentQuery,
        options: &FindOptions,
    ) -> Result<FindResult<Doc>> {
        self.head().find_all(ctx, class, query, options)
    }

    pub fn search_fulltext(
        &self,
        ctx: &mut SessionContext,
        query: &SearchQuery,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        self.head().search_fulltext(ctx, query, options)
    }

    pub fn domain_request(&self, ctx: &mut SessionContext, domain: &str, params: &Value) -> Result<Outcome<Value>> {
        match self.head().domain_request(ctx, domain, params) {
            Ok(result) => Ok(Self::drain(ctx, result)),
            Err(e) => {
                ctx.derived.clear();
                ctx.deferred.clear();
                Err(e)
            }
        }
    }

    fn drain<T>(ctx: &mut SessionContext, result: T) -> Outcome<T> {
        Outcome {
            result,
            derived: mem::take(&mut ctx.derived),
            deferred: mem::take(&mut ctx.deferred),
        }
    }

    /// Run deferred tasks, and whatever they queue in turn, each round under
    /// a fresh follow-up context. `publish` gets every round's applied
    /// transactions. A failing task is logged and does not stop the others.
    pub fn run_deferred<F>(&self, ctx: &SessionContext, tasks: Vec<DeferredTask>, mut publish: F)
    where
        F: FnMut(&SessionContext, Vec<Tx>),
    {
        let mut tasks = tasks;
        let mut parent: Option<SessionContext> = None;
        while !tasks.is_empty() {
            let mut follow_up = parent.as_ref().unwrap_or(ctx).follow_up();
            for task in tasks {
                let name = task.name.clone();
                if let Err(e) = task.run(&mut follow_up, self) {
                    warn!(
                        workspace = %self.context.workspace,
                        task = %name,
                        correlation = %follow_up.correlation_id,
                        error = %e,
                        "deferred task failed"
                    );
                }
            }
            let produced = mem::take(&mut follow_up.derived);
            tasks = mem::take(&mut follow_up.deferred);
            if !produced.is_empty() {
                publish(&follow_up, produced);
            }
            parent = Some(follow_up);
        }
    }

    /// Decide who receives which of `txes`.
    pub fn plan_broadcast(&self, ctx: &SessionContext, txes: Vec<Tx>) -> BroadcastPlan {
        let mut plan = BroadcastPlan::new(txes);
        for m in &self.middlewares {
            m.handle_broadcast(ctx, &self.context, &mut plan);
        }
        plan
    }

    pub fn load_model(&self, last: Timestamp, hash: Option<&str>) -> LoadModelResponse {
        self.context.model.read().load_model(last, hash)
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::model::{classes, core::class_def, core_model, AccountRole, TxFactory};
    use crate::storage::MemoryAdapter;
    use parking_lot::Mutex;
    use serde_json::Map;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn tx(&self, ctx: &mut SessionContext, tx: &Tx, next: Next<'_>) -> Result<TxResult> {
            self.log.lock().push(format!("{}:before", self.name));
            let result = next.tx(ctx, tx);
            self.log.lock().push(format!("{}:after", self.name));
            result
        }
    }

    fn context() -> Arc<PipelineContext> {
        let mut txes = core_model();
        txes.push(class_def("task:class:Task", Some(classes::DOC), Some("task")));
        Arc::new(PipelineContext::new(
            "ws",
            txes,
            AdapterRegistry::new(Arc::new(MemoryAdapter::new())),
        ))
    }

    #[test]
    fn test_chain_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            context(),
            vec![
                Box::new(Recorder { name: "a", log: log.clone() }),
                Box::new(Recorder { name: "b", log: log.clone() }),
            ],
        );
        let mut ctx = SessionContext::new("ws", Identity::new("alice", AccountRole::User));
        let tx = TxFactory::new("alice").create_doc("task:class:Task", "s", "t1", Map::new());

        let outcome = pipeline.submit(&mut ctx, &tx).unwrap();
        assert_eq!(*log.lock(), vec!["a:before", "b:before", "b:after", "a:after"]);
        assert_eq!(outcome.derived, vec![tx]);
        assert!(ctx.derived.is_empty());
    }

    #[test]
    fn test_instance_ids_differ() {
        let ctx = context();
        let a = Pipeline::new(ctx.clone(), Vec::new());
        let b = Pipeline::new(ctx, Vec::new());
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn test_broadcast_plan_visibility() {
        let f = TxFactory::new("alice");
        let mut plan = BroadcastPlan::new(vec![f.remove_doc("c", "s", "1"), f.remove_doc("c", "s", "2")]);
        plan.entries[1].targets = Some(["alice".to_string()].into_iter().collect());

        let bob = Identity::new("bob", AccountRole::User);
        let alice = Identity::new("alice", AccountRole::User);
        assert_eq!(plan.visible_to(&bob).len(), 1);
        assert_eq!(plan.visible_to(&alice).len(), 2);
    }

    #[test]
    fn test_follow_up_runs_as_system() {
        let ctx = SessionContext::new("ws", Identity::new("alice", AccountRole::User)).with_session("s1");
        let follow_up = ctx.follow_up();
        assert!(follow_up.identity.is_system());
        assert_eq!(follow_up.session_id.as_deref(), Some("s1"));
        assert_ne!(follow_up.correlation_id, ctx.correlation_id);
    }

    #[test]
    fn test_failed_submit_leaves_nothing() {
        let pipeline = Pipeline::new(context(), Vec::new());
        let mut ctx = SessionContext::system("ws");
        let tx = TxFactory::new("alice").create_doc("nope:class:Missing", "s", "x", Map::new());
        assert!(pipeline.submit(&mut ctx, &tx).is_err());
        assert!(ctx.derived.is_empty());
    }
}
