//! Store adapters
//!
//! The synchronization core never touches storage directly. Everything goes
//! through `StoreAdapter`, looked up per domain in an `AdapterRegistry`. The
//! crate ships one adapter, the in-memory `MemoryAdapter`.

pub mod memory;

pub use memory::MemoryAdapter;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::model::{
    Doc, DocInfo, Domain, DocumentQuery, FindOptions, FindResult, Hierarchy, Ref, SearchOptions,
    SearchQuery, SearchResult, Tx,
};

/// Outcome of applying a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    /// Set for apply-if batches: whether the conditions held and the batch ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl TxResult {
    pub fn applied() -> Self {
        Self::default()
    }

    pub fn conditional(success: bool) -> Self {
        Self {
            success: Some(success),
        }
    }

    /// False only for an apply-if whose conditions did not hold
    pub fn is_applied(&self) -> bool {
        self.success.unwrap_or(true)
    }
}

/// Pluggable document store.
///
/// Send + Sync required: one adapter is shared by every session of a
/// workspace.
pub trait StoreAdapter: Send + Sync {
    // === QUERIES ===

    /// Find documents of `class` (and its descendants).
    fn find_all(
        &self,
        hierarchy: &Hierarchy,
        class: &str,
        query: &DocumentQuery,
        options: &FindOptions,
    ) -> Result<FindResult<Doc>>;

    fn search_fulltext(
        &self,
        hierarchy: &Hierarchy,
        query: &SearchQuery,
        options: &SearchOptions,
    ) -> Result<SearchResult>;

    /// Domain-specific, non-CUD operation
    fn domain_request(&self, _hierarchy: &Hierarchy, domain: &str, _params: &Value) -> Result<Value> {
        Err(SyncError::UnsupportedDomainRequest(domain.to_string()))
    }

    // === WRITES ===

    /// Apply a transaction. Apply-if batches are applied atomically: either
    /// every nested tx lands or none does.
    fn tx(&self, hierarchy: &Hierarchy, tx: &Tx) -> Result<TxResult>;

    // === RAW DOMAIN ACCESS (backup) ===

    fn raw_doc_infos(&self, domain: &str) -> Result<Vec<DocInfo>>;

    fn load_docs(&self, domain: &str, ids: &[Ref]) -> Result<Vec<Doc>>;

    /// Insert or replace raw documents
    fn upload(&self, domain: &str, docs: Vec<Doc>) -> Result<()>;

    fn clean(&self, domain: &str, ids: &[Ref]) -> Result<()>;

    /// Hash over every document of the domain, for backup verification
    fn domain_hash(&self, domain: &str) -> Result<String>;

    // === MAINTENANCE ===

    fn estimate_count(&self, domain: &str) -> Result<usize>;

    fn ensure_indexes(&self, domain: &str) -> Result<()>;

    /// Domains currently holding data
    fn domains(&self) -> Vec<Domain>;
}

/// Adapter lookup by domain with a default fallback
#[derive(Clone)]
pub struct AdapterRegistry {
    default: Arc<dyn StoreAdapter>,
    by_domain: HashMap<Domain, Arc<dyn StoreAdapter>>,
}

impl AdapterRegistry {
    pub fn new(default: Arc<dyn StoreAdapter>) -> Self {
        Self {
            default,
            by_domain: HashMap::new(),
        }
    }

    pub fn with_domain(mut self, domain: &str, adapter: Arc<dyn StoreAdapter>) -> Self {
        self.by_domain.insert(domain.to_string(), adapter);
        self
    }

    pub fn get(&self, domain: &str) -> &Arc<dyn StoreAdapter> {
        self.by_domain.get(domain).unwrap_or(&self.default)
    }

    pub fn default_adapter(&self) -> &Arc<dyn StoreAdapter> {
        &self.default
    }

    /// Union of domains known to any registered adapter
    pub fn domains(&self) -> BTreeSet<Domain> {
        let mut result: BTreeSet<Domain> = self.default.domains().into_iter().collect();
        for (domain, adapter) in &self.by_domain {
            result.insert(domain.clone());
            result.extend(adapter.domains());
        }
        result
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn test_registry_routes_by_domain() {
        let default: Arc<dyn StoreAdapter> = Arc::new(MemoryAdapter::new());
        let blobs: Arc<dyn StoreAdapter> = Arc::new(MemoryAdapter::new());
        let registry = AdapterRegistry::new(default.clone()).with_domain("blob", blobs.clone());

        assert!(Arc::ptr_eq(registry.get("blob"), &blobs));
        assert!(Arc::ptr_eq(registry.get("task"), &default));
        assert!(registry.domains().contains("blob"));
    }

    #[test]
    fn test_tx_result_shape() {
        assert_eq!(serde_json::to_string(&TxResult::applied()).unwrap(), "{}");
        assert!(!TxResult::conditional(false).is_applied());
        assert!(TxResult::conditional(true).is_applied());
    }
}
