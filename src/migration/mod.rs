//! Workspace migrations
//!
//! A migration is a list of `MigrateOperation`s, one per plugin, run by the
//! `MigrationOrchestrator` in four phases (pre-migrate, indexes, migrate,
//! upgrade). Completed steps are recorded as `{plugin, state}` documents in
//! the `migration` domain; that ledger is what makes a second run a no-op.

pub mod client;
pub mod orchestrator;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::model::{classes, domains, generate_id, spaces, FindOptions};
use crate::pipeline::PipelineContext;

pub use client::{MigrationClient, TxOperations, UpgradeClient};
pub use orchestrator::{MigrationOrchestrator, MigrationReport};

/// Plugin name under which the orchestrator records its own steps
pub const CORE_PLUGIN: &str = "core";

/// Ledger state marking index maintenance as done
pub const INDEXES_STATE: &str = "indexes-v5";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Build indexes once, then record `core/indexes-v5`
    #[default]
    Perform,
    /// Leave indexes for a later run
    Skip,
    /// Record `core/indexes-v5` without building anything
    Disable,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MigrationState {
    pub plugin: String,
    pub state: String,
}

/// Completed migration steps of one workspace. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationLedger {
    states: BTreeMap<String, BTreeSet<String>>,
}

impl MigrationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every recorded state from the workspace store.
    pub fn load(context: &PipelineContext) -> Result<Self> {
        let docs = {
            let hierarchy = context.hierarchy.read();
            context.adapter(domains::MIGRATION).find_all(
                &hierarchy,
                classes::MIGRATION_STATE,
                &Map::new(),
                &FindOptions::default(),
            )?
        };

        let mut ledger = Self::new();
        for doc in &docs.value {
            let plugin = doc.get("plugin").and_then(Value::as_str);
            let state = doc.get("state").and_then(Value::as_str);
            if let (Some(plugin), Some(state)) = (plugin, state) {
                ledger.insert(plugin, state);
            }
        }
        debug!(workspace = %context.workspace, states = ledger.len(), "migration ledger loaded");
        Ok(ledger)
    }

    pub fn has(&self, plugin: &str, state: &str) -> bool {
        self.states.get(plugin).is_some_and(|s| s.contains(state))
    }

    /// Returns false if the state was already present
    pub fn insert(&mut self, plugin: &str, state: &str) -> bool {
        self.states
            .entry(plugin.to_string())
            .or_default()
            .insert(state.to_string())
    }

    pub fn plugin(&self, plugin: &str) -> Vec<&str> {
        self.states
            .get(plugin)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.states.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = MigrationState> + '_ {
        self.states.iter().flat_map(|(plugin, states)| {
            states.iter().map(move |state| MigrationState {
                plugin: plugin.clone(),
                state: state.clone(),
            })
        })
    }
}

/// A client that can see and extend the ledger.
pub trait LedgerClient: TxOperations {
    fn ledger(&self) -> &MigrationLedger;

    fn ledger_mut(&mut self) -> &mut MigrationLedger;

    /// Persist `{plugin, state}` and add it to the in-memory ledger.
    fn record_state(&mut self, plugin: &str, state: &str) -> Result<()> {
        if self.ledger().has(plugin, state) {
            return Ok(());
        }
        let mut attributes = Map::new();
        attributes.insert("plugin".to_string(), Value::String(plugin.to_string()));
        attributes.insert("state".to_string(), Value::String(state.to_string()));
        self.create_doc(
            classes::MIGRATION_STATE,
            spaces::CONFIGURATION,
            &generate_id(),
            attributes,
        )?;
        self.ledger_mut().insert(plugin, state);
        Ok(())
    }
}

/// One plugin's migration.
///
/// Every phase sees the ledger through its client; steps are expected to
/// skip work already recorded there (see `try_migrate`).
pub trait MigrateOperation: Send + Sync {
    fn name(&self) -> &str;

    /// Runs against a throwaway store holding only the target model.
    fn pre_migrate(&self, _client: &mut MigrationClient) -> Result<()> {
        Ok(())
    }

    fn migrate(&self, client: &mut MigrationClient) -> Result<()>;

    /// Runs through the live pipeline, so changes reach connected sessions.
    fn upgrade(&self, _client: &mut UpgradeClient) -> Result<()> {
        Ok(())
    }
}

/// A named, run-once step for `try_migrate`
pub struct MigrateStep<'a, C: ?Sized> {
    pub state: &'a str,
    pub func: &'a dyn Fn(&mut C) -> Result<()>,
}

impl<'a, C: ?Sized> MigrateStep<'a, C> {
    pub fn new(state: &'a str, func: &'a dyn Fn(&mut C) -> Result<()>) -> Self {
        Self { state, func }
    }
}

/// Run each step of `plugin` not yet in the ledger, in order, recording it
/// after it succeeds. Stops at the first failure. Returns how many ran.
pub fn try_migrate<C: LedgerClient>(client: &mut C, plugin: &str, steps: &[MigrateStep<'_, C>]) -> Result<usize> {
    let mut ran = 0;
    for step in steps {
        if client.ledger().has(plugin, step.state) {
            continue;
        }
        let started = Instant::now();
        (step.func)(client).map_err(|e| SyncError::Migration {
            step: format!("{}/{}", plugin, step.state),
            reason: e.to_string(),
        })?;
        client.record_state(plugin, step.state)?;
        info!(
            plugin,
            state = step.state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "migration step applied"
        );
        ran += 1;
    }
    Ok(ran)
}
