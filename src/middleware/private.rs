//! Private domain guard
//!
//! Documents of a private domain (user preferences by default) belong to
//! their creator. Writes by anyone else are rejected, reads are narrowed to
//! the caller's own documents, broadcasts of their transactions only reach
//! the owner, and joined `$lookup` results never expose someone else's
//! private documents. The system identity bypasses all of it.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::{json, Map, Value};
use tracing::warn;

use super::{Identity, Middleware};
use crate::error::{Result, SyncError};
use crate::model::doc::{CREATED_BY, ID, LOOKUP};
use crate::model::{
    domains, Doc, Domain, DocumentQuery, FindOptions, FindResult, Hierarchy, Ref, SearchOptions,
    SearchQuery, SearchResult, Tx, TxOp, SYSTEM_ACCOUNT,
};
use crate::pipeline::{BroadcastFilter, BroadcastPlan, Next, PipelineContext, SessionContext};
use crate::storage::TxResult;

pub struct PrivateDomainGuard {
    domains: HashSet<Domain>,
}

impl Default for PrivateDomainGuard {
    fn default() -> Self {
        Self::new([domains::PREFERENCE.to_string()])
    }
}

impl PrivateDomainGuard {
    pub fn new(domains: impl IntoIterator<Item = Domain>) -> Self {
        Self {
            domains: domains.into_iter().collect(),
        }
    }

    pub fn is_private(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    fn private_domain_of(&self, hierarchy: &Hierarchy, class: &str) -> Option<Domain> {
        hierarchy.find_domain(class).filter(|d| self.is_private(d)).cloned()
    }

    /// Does `doc` belong to someone other than `identity`?
    fn is_foreign(&self, hierarchy: &Hierarchy, identity: &Identity, doc: &Value) -> bool {
        let class = doc.get("_class").and_then(Value::as_str).unwrap_or_default();
        if self.private_domain_of(hierarchy, class).is_none() {
            return false;
        }
        match doc.get(CREATED_BY).and_then(Value::as_str) {
            Some(creator) => !identity.matches(creator),
            None => true,
        }
    }

    fn strip_lookups(&self, hierarchy: &Hierarchy, identity: &Identity, result: &mut FindResult<Doc>) {
        for doc in &mut result.value {
            if let Some(Value::Object(joined)) = doc.0.get_mut(LOOKUP) {
                for value in joined.values_mut() {
                    match value {
                        Value::Array(items) => items.retain(|item| !self.is_foreign(hierarchy, identity, item)),
                        other => {
                            if self.is_foreign(hierarchy, identity, other) {
                                *other = Value::Null;
                            }
                        }
                    }
                }
            }
        }
        if let Some(map) = &mut result.lookup_map {
            map.retain(|_, doc| !self.is_foreign(hierarchy, identity, doc));
        }
    }

    /// `_class` of every query carried by a domain request
    fn requested_classes(params: &Value) -> Vec<&str> {
        ["find", "count"]
            .iter()
            .filter_map(|key| params.get(key)?.get("_class")?.as_str())
            .collect()
    }

    /// Transaction log entries about private documents of other accounts
    fn is_foreign_tx(&self, hierarchy: &Hierarchy, identity: &Identity, doc: &Doc) -> bool {
        let object_class = doc.get("objectClass").and_then(Value::as_str).unwrap_or_default();
        if self.private_domain_of(hierarchy, object_class).is_none() {
            return false;
        }
        let owner = doc.created_by().or_else(|| doc.modified_by()).unwrap_or_default();
        !identity.matches(owner)
    }
}

impl Middleware for PrivateDomainGuard {
    fn name(&self) -> &'static str {
        "private-domain"
    }

    fn tx(&self, ctx: &mut SessionContext, tx: &Tx, next: Next<'_>) -> Result<TxResult> {
        // Leaves touching private domains, resolved before the chain runs
        let private_leaves: Vec<(&Tx, Domain)> = {
            let hierarchy = next.context().hierarchy.read();
            tx.leaves()
                .into_iter()
                .filter_map(|leaf| {
                    self.private_domain_of(&hierarchy, &leaf.object_class)
                        .map(|d| (leaf, d))
                })
                .collect()
        };
        if private_leaves.is_empty() {
            return next.tx(ctx, tx);
        }

        let mut owners: HashMap<Ref, Ref> = HashMap::new();
        for (leaf, _) in &private_leaves {
            let owner = match &leaf.op {
                TxOp::CreateDoc { .. } => Some(leaf.creator().clone()),
                _ => {
                    let mut query = Map::new();
                    query.insert(ID.to_string(), Value::String(leaf.object_id.clone()));
                    let options = FindOptions {
                        limit: Some(1),
                        ..Default::default()
                    };
                    next.find_all(ctx, &leaf.object_class, &query, &options)?
                        .value
                        .first()
                        .and_then(|d| d.created_by().map(str::to_string))
                }
            };
            let Some(owner) = owner else { continue };

            if !ctx.identity.is_system() && !ctx.identity.matches(&owner) {
                warn!(
                    workspace = %ctx.workspace,
                    account = %ctx.identity.account,
                    object = %leaf.object_id,
                    "write to foreign private document rejected"
                );
                return Err(SyncError::Forbidden(format!(
                    "{} belongs to another account",
                    leaf.object_id
                )));
            }
            owners.insert(leaf.object_id.clone(), owner);
        }

        let result = next.tx(ctx, tx)?;
        if result.is_applied() {
            for (leaf, domain) in private_leaves {
                let mut targets = BTreeSet::new();
                targets.insert(SYSTEM_ACCOUNT.to_string());
                targets.insert(ctx.identity.account.clone());
                if let Some(owner) = owners.get(&leaf.object_id) {
                    targets.insert(owner.clone());
                }
                ctx.broadcast_filters.push(BroadcastFilter {
                    domain,
                    object_id: leaf.object_id.clone(),
                    targets,
                });
            }
        }
        Ok(result)
    }

    fn find_all(
        &self,
        ctx: &mut SessionContext,
        class: &str,
        query: &DocumentQuery,
        options: &FindOptions,
        next: Next<'_>,
    ) -> Result<FindResult<Doc>> {
        if ctx.identity.is_system() {
            return next.find_all(ctx, class, query, options);
        }

        let (is_private, is_tx_log) = {
            let hierarchy = next.context().hierarchy.read();
            (
                self.private_domain_of(&hierarchy, class).is_some(),
                hierarchy.find_domain(class).map_or(false, |d| d == domains::TX),
            )
        };

        let mut result = if is_private {
            let mut narrowed = query.clone();
            narrowed.insert(CREATED_BY.to_string(), json!({ "$in": ctx.identity.ids() }));
            next.find_all(ctx, class, &narrowed, options)?
        } else {
            next.find_all(ctx, class, query, options)?
        };

        let hierarchy = next.context().hierarchy.read();
        if is_tx_log {
            let before = result.value.len();
            result
                .value
                .retain(|doc| !self.is_foreign_tx(&hierarchy, &ctx.identity, doc));
            if result.total >= 0 {
                result.total -= (before - result.value.len()) as i64;
            }
        }
        self.strip_lookups(&hierarchy, &ctx.identity, &mut result);
        Ok(result)
    }

    fn search_fulltext(
        &self,
        ctx: &mut SessionContext,
        query: &SearchQuery,
        options: &SearchOptions,
        next: Next<'_>,
    ) -> Result<SearchResult> {
        let mut result = next.search_fulltext(ctx, query, options)?;
        if !ctx.identity.is_system() {
            let hierarchy = next.context().hierarchy.read();
            result
                .docs
                .retain(|d| self.private_domain_of(&hierarchy, &d.class).is_none());
        }
        Ok(result)
    }

    fn domain_request(
        &self,
        ctx: &mut SessionContext,
        domain: &str,
        params: &Value,
        next: Next<'_>,
    ) -> Result<Value> {
        if ctx.identity.is_system() {
            return next.domain_request(ctx, domain, params);
        }
        if self.is_private(domain) || domain == domains::TX {
            return Err(SyncError::Forbidden(format!(
                "domain requests against private domain {}",
                domain
            )));
        }
        // Domain requests are not narrowed, so a query naming a private
        // class is refused whatever domain it was addressed to
        {
            let hierarchy = next.context().hierarchy.read();
            for class in Self::requested_classes(params) {
                let Some(target) = hierarchy.find_domain(class) else {
                    continue;
                };
                if self.is_private(target) || target == domains::TX {
                    warn!(
                        workspace = %ctx.workspace,
                        account = %ctx.identity.account,
                        class,
                        "domain request for private class rejected"
                    );
                    return Err(SyncError::Forbidden(format!("domain request for {}", class)));
                }
            }
        }
        next.domain_request(ctx, domain, params)
    }

    fn handle_broadcast(&self, ctx: &SessionContext, context: &PipelineContext, plan: &mut BroadcastPlan) {
        let hierarchy = context.hierarchy.read();
        for entry in &mut plan.entries {
            let Some(domain) = self.private_domain_of(&hierarchy, &entry.tx.object_class) else {
                continue;
            };
            let filter = ctx
                .broadcast_filters
                .iter()
                .find(|f| f.domain == domain && f.object_id == entry.tx.object_id);
            let targets = match filter {
                Some(f) => f.targets.clone(),
                None => [
                    entry.tx.creator().clone(),
                    SYSTEM_ACCOUNT.to_string(),
                    ctx.identity.account.clone(),
                ]
                .into_iter()
                .collect(),
            };
            entry.targets = Some(targets);
        }
    }
}
