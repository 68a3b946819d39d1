//! Terminal link of the chain: routes calls to the store adapter of the
//! target domain.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::model::{
    domains, Doc, DocumentQuery, FindOptions, FindResult, Hierarchy, SearchOptions, SearchQuery,
    SearchResult, Tx,
};
use crate::pipeline::{PipelineContext, SessionContext};
use crate::storage::{StoreAdapter, TxResult};

/// Adapter owning the domain of every leaf of `tx`.
fn route<'a>(context: &'a PipelineContext, hierarchy: &Hierarchy, tx: &Tx) -> Result<&'a Arc<dyn StoreAdapter>> {
    let mut adapter: Option<&Arc<dyn StoreAdapter>> = None;
    for leaf in tx.leaves() {
        let domain = if leaf.is_workspace_event() {
            domains::TX.to_string()
        } else {
            hierarchy.get_domain(&leaf.object_class)?
        };
        let candidate = context.adapter(&domain);
        match adapter {
            Some(a) if !Arc::ptr_eq(a, candidate) => {
                return Err(SyncError::Store(format!(
                    "tx {} spans more than one store adapter",
                    tx.id
                )))
            }
            _ => adapter = Some(candidate),
        }
    }
    Ok(adapter.unwrap_or_else(|| context.adapters.default_adapter()))
}

pub(crate) fn tx(context: &PipelineContext, ctx: &mut SessionContext, tx: &Tx) -> Result<TxResult> {
    let result = {
        let hierarchy = context.hierarchy.read();
        let adapter = route(context, &hierarchy, tx)?;
        adapter.tx(&hierarchy, tx)?
    };

    if result.is_applied() {
        ctx.derived.extend(tx.leaves().into_iter().cloned());
    }
    Ok(result)
}

pub(crate) fn find_all(
    context: &PipelineContext,
    class: &str,
    query: &DocumentQuery,
    options: &FindOptions,
) -> Result<FindResult<Doc>> {
    let hierarchy = context.hierarchy.read();
    let domain = hierarchy.get_domain(class)?;
    context.adapter(&domain).find_all(&hierarchy, class, query, options)
}

pub(crate) fn search_fulltext(
    context: &PipelineContext,
    query: &SearchQuery,
    options: &SearchOptions,
) -> Result<SearchResult> {
    let hierarchy = context.hierarchy.read();
    context
        .adapters
        .default_adapter()
        .search_fulltext(&hierarchy, query, options)
}

pub(crate) fn domain_request(context: &PipelineContext, domain: &str, params: &Value) -> Result<Value> {
    let hierarchy = context.hierarchy.read();
    context.adapter(domain).domain_request(&hierarchy, domain, params)
}
