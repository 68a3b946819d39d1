//! Migration orchestrator
//!
//! Phases, in order:
//!
//! 0. model sync: store target-model transactions the workspace lacks and
//!    rebuild the pipeline if anything was added
//! 1. pre-migrate against a preparation client (fresh in-memory store)
//! 2. index maintenance, recorded once as `core/indexes-v5`
//! 3. migrate through a `MigrationClient`; the first failure aborts
//! 4. upgrade through an `UpgradeClient`
//!
//! Finally every live session of the workspace is force-closed so clients
//! reconnect against the new model.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use super::client::{MigrationClient, UpgradeClient};
use super::{IndexMode, LedgerClient, MigrateOperation, MigrationLedger, CORE_PLUGIN, INDEXES_STATE};
use crate::error::{Result, SyncError};
use crate::middleware::store;
use crate::model::{domains, Domain, Tx};
use crate::pipeline::{PipelineContext, SessionContext};
use crate::workspace_manager::{TransactorControl, Workspace};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub workspace: String,
    /// Model transactions added by the sync phase
    pub model_added: usize,
    pub pipeline_rebuilt: bool,
    pub indexed_domains: Vec<Domain>,
    /// Ledger entries added by this run
    pub states_recorded: usize,
    pub sessions_closed: usize,
    pub elapsed_ms: u64,
}

pub struct MigrationOrchestrator {
    workspace: Arc<Workspace>,
    control: Arc<dyn TransactorControl>,
    index_mode: IndexMode,
    operations: Vec<Box<dyn MigrateOperation>>,
}

impl MigrationOrchestrator {
    pub fn new(workspace: Arc<Workspace>, control: Arc<dyn TransactorControl>) -> Self {
        Self {
            workspace,
            control,
            index_mode: IndexMode::Perform,
            operations: Vec::new(),
        }
    }

    pub fn with_index_mode(mut self, mode: IndexMode) -> Self {
        self.index_mode = mode;
        self
    }

    /// Operations run in the order they were added
    pub fn with_operation(mut self, operation: impl MigrateOperation + 'static) -> Self {
        self.operations.push(Box::new(operation));
        self
    }

    pub fn operation_names(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.name()).collect()
    }

    /// Bring the workspace up to `target_model` and run every operation.
    pub fn run(&self, target_model: Vec<Tx>) -> Result<MigrationReport> {
        let started = Instant::now();
        let name = self.workspace.name().to_string();
        info!(workspace = %name, operations = self.operations.len(), "migration started");

        let model_added = self.sync_model(&target_model)?;
        let context = Arc::clone(self.workspace.pipeline().context());

        let ledger = MigrationLedger::load(&context)?;
        let initial_states = ledger.len();

        self.pre_migrate(&context, &ledger)?;

        let mut client = MigrationClient::new(Arc::clone(&context), ledger);
        let indexed_domains = self.maintain_indexes(&mut client)?;

        for op in &self.operations {
            Self::run_step(&name, op.name(), "migrate", || op.migrate(&mut client))?;
        }

        let mut upgrade = UpgradeClient::new(Arc::clone(&self.workspace), client.into_ledger());
        for op in &self.operations {
            Self::run_step(&name, op.name(), "upgrade", || op.upgrade(&mut upgrade))?;
        }
        let states_recorded = upgrade.ledger().len() - initial_states;

        let sessions_closed = self.control.force_close(&name)?;

        let report = MigrationReport {
            workspace: name,
            model_added,
            pipeline_rebuilt: model_added > 0,
            indexed_domains,
            states_recorded,
            sessions_closed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            workspace = %report.workspace,
            model_added = report.model_added,
            states_recorded = report.states_recorded,
            sessions_closed = report.sessions_closed,
            elapsed_ms = report.elapsed_ms,
            "migration complete"
        );
        Ok(report)
    }

    /// Store the target-model transactions the workspace does not have yet.
    fn sync_model(&self, target_model: &[Tx]) -> Result<usize> {
        let pipeline = self.workspace.pipeline();
        let context = pipeline.context();

        let missing: Vec<&Tx> = {
            let model = context.model.read();
            target_model.iter().filter(|tx| !model.contains(&tx.id)).collect()
        };
        if missing.is_empty() {
            debug!(workspace = %context.workspace, "model up to date");
            return Ok(0);
        }

        let mut ctx = SessionContext::system(&context.workspace);
        let mut txes = context.model.read().txes().to_vec();
        for tx in &missing {
            store::tx(context, &mut ctx, tx).map_err(|e| SyncError::Migration {
                step: "model".to_string(),
                reason: e.to_string(),
            })?;
            txes.push((*tx).clone());
        }

        self.workspace.rebuild_pipeline(txes);
        info!(workspace = %context.workspace, added = missing.len(), "model synchronized");
        Ok(missing.len())
    }

    fn pre_migrate(&self, context: &PipelineContext, ledger: &MigrationLedger) -> Result<()> {
        let model = context.model.read().txes().to_vec();
        let mut prep = MigrationClient::preparation(&context.workspace, model, ledger.clone());
        for op in &self.operations {
            Self::run_step(&context.workspace, op.name(), "pre-migrate", || op.pre_migrate(&mut prep))?;
        }
        Ok(())
    }

    fn maintain_indexes(&self, client: &mut MigrationClient) -> Result<Vec<Domain>> {
        if client.ledger().has(CORE_PLUGIN, INDEXES_STATE) {
            return Ok(Vec::new());
        }
        match self.index_mode {
            IndexMode::Skip => {
                debug!(workspace = %client.context().workspace, "index maintenance skipped");
                Ok(Vec::new())
            }
            IndexMode::Disable => {
                client.record_state(CORE_PLUGIN, INDEXES_STATE)?;
                Ok(Vec::new())
            }
            IndexMode::Perform => {
                let context = Arc::clone(client.context());
                let mut targets: BTreeSet<Domain> = context.hierarchy.read().domains();
                targets.extend(context.adapters.domains());
                targets.retain(|d| {
                    !matches!(d.as_str(), domains::MODEL | domains::TRANSIENT | domains::BENCHMARK)
                });

                let started = Instant::now();
                for domain in &targets {
                    let adapter = context.adapter(domain);
                    let count = adapter.estimate_count(domain)?;
                    adapter.ensure_indexes(domain)?;
                    debug!(workspace = %context.workspace, domain = %domain, count, "indexes ensured");
                }
                client.record_state(CORE_PLUGIN, INDEXES_STATE)?;
                info!(
                    workspace = %context.workspace,
                    domains = targets.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "index maintenance done"
                );
                Ok(targets.into_iter().collect())
            }
        }
    }

    fn run_step<F>(workspace: &str, operation: &str, phase: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let started = Instant::now();
        let result = f();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                debug!(workspace, operation, phase, elapsed_ms, "migration step done");
                Ok(())
            }
            Err(e) => {
                error!(workspace, operation, phase, elapsed_ms, error = %e, "migration step failed");
                Err(match e {
                    SyncError::Migration { .. } => e,
                    other => SyncError::Migration {
                        step: format!("{}:{}", operation, phase),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }
}
