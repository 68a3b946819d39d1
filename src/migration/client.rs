//! Clients handed to migration steps
//!
//! `MigrationClient` writes straight to the store adapters: no guards, no
//! triggers, no broadcast. `UpgradeClient` goes through the workspace's live
//! pipeline like any session would, so connected clients see the changes.

use std::sync::Arc;

use parking_lot::RwLockReadGuard;
use serde_json::{Map, Value};
use tracing::debug;

use super::{LedgerClient, MigrationLedger};
use crate::error::Result;
use crate::middleware::store;
use crate::model::{
    spaces, Doc, DocumentQuery, FindOptions, FindResult, Hierarchy, Ref, Tx, TxFactory, SYSTEM_ACCOUNT,
};
use crate::pipeline::{PipelineContext, SessionContext};
use crate::storage::{AdapterRegistry, MemoryAdapter, TxResult};
use crate::workspace_manager::Workspace;

/// Document operations shared by both clients, built on `tx` and `find_all`.
pub trait TxOperations {
    fn factory(&self) -> &TxFactory;

    fn tx(&mut self, tx: &Tx) -> Result<TxResult>;

    fn find_all(&self, class: &str, query: &DocumentQuery, options: &FindOptions) -> Result<FindResult<Doc>>;

    fn find(&self, class: &str, query: &DocumentQuery) -> Result<Vec<Doc>> {
        Ok(self.find_all(class, query, &FindOptions::default())?.value)
    }

    fn find_one(&self, class: &str, query: &DocumentQuery) -> Result<Option<Doc>> {
        let options = FindOptions {
            limit: Some(1),
            ..Default::default()
        };
        Ok(self.find_all(class, query, &options)?.value.into_iter().next())
    }

    fn create_doc(&mut self, class: &str, space: &str, id: &str, attributes: Map<String, Value>) -> Result<Ref> {
        let tx = self.factory().create_doc(class, space, id, attributes);
        self.tx(&tx)?;
        Ok(id.to_string())
    }

    fn update_doc(&mut self, class: &str, space: &str, id: &str, operations: Map<String, Value>) -> Result<()> {
        let tx = self.factory().update_doc(class, space, id, operations);
        self.tx(&tx).map(|_| ())
    }

    fn remove_doc(&mut self, class: &str, space: &str, id: &str) -> Result<()> {
        let tx = self.factory().remove_doc(class, space, id);
        self.tx(&tx).map(|_| ())
    }

    /// Apply `operations` to every document matching `query`.
    fn update_many(&mut self, class: &str, query: &DocumentQuery, operations: Map<String, Value>) -> Result<usize> {
        let docs = self.find(class, query)?;
        for doc in &docs {
            let (Some(id), Some(doc_class), Some(space)) = (doc.id(), doc.class(), doc.space()) else {
                continue;
            };
            self.update_doc(doc_class, space, id, operations.clone())?;
        }
        Ok(docs.len())
    }
}

pub struct MigrationClient {
    context: Arc<PipelineContext>,
    factory: TxFactory,
    ledger: MigrationLedger,
    applied: usize,
}

impl MigrationClient {
    pub fn new(context: Arc<PipelineContext>, ledger: MigrationLedger) -> Self {
        Self {
            context,
            factory: TxFactory::new(SYSTEM_ACCOUNT),
            ledger,
            applied: 0,
        }
    }

    /// Client over an empty in-memory store that knows only `model_txes`.
    pub fn preparation(workspace: &str, model_txes: Vec<Tx>, ledger: MigrationLedger) -> Self {
        let adapters = AdapterRegistry::new(Arc::new(MemoryAdapter::new()));
        Self::new(Arc::new(PipelineContext::new(workspace, model_txes, adapters)), ledger)
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    pub fn hierarchy(&self) -> RwLockReadGuard<'_, Hierarchy> {
        self.context.hierarchy.read()
    }

    /// Transactions applied through this client
    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn into_ledger(self) -> MigrationLedger {
        self.ledger
    }
}

impl TxOperations for MigrationClient {
    fn factory(&self) -> &TxFactory {
        &self.factory
    }

    fn tx(&mut self, tx: &Tx) -> Result<TxResult> {
        let mut ctx = SessionContext::system(&self.context.workspace);
        let result = store::tx(&self.context, &mut ctx, tx)?;
        if result.is_applied() {
            self.applied += 1;
            self.context.append_model(
                tx.leaves()
                    .into_iter()
                    .filter(|leaf| leaf.object_space == spaces::MODEL),
            );
        }
        Ok(result)
    }

    fn find_all(&self, class: &str, query: &DocumentQuery, options: &FindOptions) -> Result<FindResult<Doc>> {
        store::find_all(&self.context, class, query, options)
    }
}

impl LedgerClient for MigrationClient {
    fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut MigrationLedger {
        &mut self.ledger
    }
}

pub struct UpgradeClient {
    workspace: Arc<Workspace>,
    factory: TxFactory,
    ledger: MigrationLedger,
    broadcasts: usize,
}

impl UpgradeClient {
    pub fn new(workspace: Arc<Workspace>, ledger: MigrationLedger) -> Self {
        Self {
            workspace,
            factory: TxFactory::new(SYSTEM_ACCOUNT),
            ledger,
            broadcasts: 0,
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Session deliveries made by this client's transactions
    pub fn broadcasts(&self) -> usize {
        self.broadcasts
    }

    pub fn into_ledger(self) -> MigrationLedger {
        self.ledger
    }

    fn context(&self) -> SessionContext {
        SessionContext::system(self.workspace.name())
    }
}

impl TxOperations for UpgradeClient {
    fn factory(&self) -> &TxFactory {
        &self.factory
    }

    fn tx(&mut self, tx: &Tx) -> Result<TxResult> {
        let pipeline = self.workspace.pipeline();
        let mut ctx = self.context();
        let outcome = pipeline.submit(&mut ctx, tx)?;

        let workspace = &self.workspace;
        let mut delivered = 0;
        if !outcome.derived.is_empty() {
            let plan = pipeline.plan_broadcast(&ctx, outcome.derived);
            delivered += workspace.broadcast(&plan, None);
        }
        pipeline.run_deferred(&ctx, outcome.deferred, |follow_up, produced| {
            let plan = pipeline.plan_broadcast(follow_up, produced);
            delivered += workspace.broadcast(&plan, None);
        });
        debug!(workspace = %workspace.name(), tx = %tx.id, delivered, "upgrade tx");
        self.broadcasts += delivered;
        Ok(outcome.result)
    }

    fn find_all(&self, class: &str, query: &DocumentQuery, options: &FindOptions) -> Result<FindResult<Doc>> {
        self.workspace
            .pipeline()
            .find_all(&mut self.context(), class, query, options)
    }
}

impl LedgerClient for UpgradeClient {
    fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut MigrationLedger {
        &mut self.ledger
    }
}
