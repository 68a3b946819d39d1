//! Middleware chain
//!
//! Every query and transaction of a workspace passes through an ordered list
//! of middlewares before reaching the store. A middleware sees the call and
//! a `Next` cursor over the rest of the chain. It may reject the call,
//! rewrite it, or delegate and post-process the result. Hooks a middleware
//! does not override delegate unchanged.

pub mod model;
pub mod origin;
pub mod plugin_config;
pub mod private;
pub mod store;
pub mod triggers;

pub use model::ModelMiddleware;
pub use origin::TxOriginGuard;
pub use plugin_config::PluginConfigurationGuard;
pub use private::PrivateDomainGuard;
pub use triggers::{Trigger, TriggerMode, TriggersMiddleware};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::model::{
    AccountRole, Doc, DocumentQuery, FindOptions, FindResult, Ref, SearchOptions, SearchQuery,
    SearchResult, Tx, SYSTEM_ACCOUNT,
};
use crate::pipeline::{BroadcastPlan, Next, PipelineContext, SessionContext};
use crate::storage::TxResult;

/// Who is performing a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub account: Ref,
    #[serde(default)]
    pub social_ids: Vec<Ref>,
    #[serde(default)]
    pub role: AccountRole,
}

impl Identity {
    pub fn new(account: impl Into<Ref>, role: AccountRole) -> Self {
        Self {
            account: account.into(),
            social_ids: Vec::new(),
            role,
        }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_ACCOUNT, AccountRole::Owner)
    }

    pub fn with_social_ids(mut self, ids: Vec<Ref>) -> Self {
        self.social_ids = ids;
        self
    }

    pub fn is_system(&self) -> bool {
        self.account == SYSTEM_ACCOUNT
    }

    /// True if `id` is this account or one of its social ids
    pub fn matches(&self, id: &str) -> bool {
        self.account == id || self.social_ids.iter().any(|s| s == id)
    }

    /// Account followed by social ids
    pub fn ids(&self) -> Vec<Ref> {
        let mut ids = vec![self.account.clone()];
        ids.extend(self.social_ids.iter().cloned());
        ids
    }
}

pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn tx(&self, ctx: &mut SessionContext, tx: &Tx, next: Next<'_>) -> Result<TxResult> {
        next.tx(ctx, tx)
    }

    fn find_all(
        &self,
        ctx: &mut SessionContext,
        class: &str,
        query: &DocumentQuery,
        options: &FindOptions,
        next: Next<'_>,
    ) -> Result<FindResult<Doc>> {
        next.find_all(ctx, class, query, options)
    }

    fn search_fulltext(
        &self,
        ctx: &mut SessionContext,
        query: &SearchQuery,
        options: &SearchOptions,
        next: Next<'_>,
    ) -> Result<SearchResult> {
        next.search_fulltext(ctx, query, options)
    }

    fn domain_request(
        &self,
        ctx: &mut SessionContext,
        domain: &str,
        params: &Value,
        next: Next<'_>,
    ) -> Result<Value> {
        next.domain_request(ctx, domain, params)
    }

    /// Narrow who receives which broadcast entries. Runs for every
    /// middleware in order; there is no delegation.
    fn handle_broadcast(&self, _ctx: &SessionContext, _context: &PipelineContext, _plan: &mut BroadcastPlan) {}
}
