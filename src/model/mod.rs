//! Document model: transactions, documents, class hierarchy, model database
//!
//! Everything persisted by the core is either a `Tx` (an immutable mutation
//! fact) or a `Doc` materialized from transactions. Classes form a single
//! inheritance tree; each class resolves to exactly one storage domain.

pub mod core;
pub mod doc;
pub mod hierarchy;
pub mod model_db;
pub mod query;
pub mod tx;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use self::core::core_model;
pub use doc::Doc;
pub use hierarchy::{ClassInfo, ClassKind, Hierarchy};
pub use model_db::{LoadModelResponse, ModelDb};
pub use query::{
    compare_docs, matches_query, DocInfo, DocumentQuery, DomainResult, FindOptions, FindResult, SearchOptions,
    SearchQuery, SearchResult, SearchResultDoc,
};
pub use tx::{ClassQuery, Tx, TxFactory, TxOp, WorkspaceEvent};

/// Reference to a document (`_id`), class or space
pub type Ref = String;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Storage domain name
pub type Domain = String;

/// Well-known class identifiers
pub mod classes {
    pub const OBJ: &str = "core:class:Obj";
    pub const DOC: &str = "core:class:Doc";
    pub const ATTACHED_DOC: &str = "core:class:AttachedDoc";
    pub const CLASS: &str = "core:class:Class";
    pub const MIXIN: &str = "core:class:Mixin";
    pub const ATTRIBUTE: &str = "core:class:Attribute";
    pub const SPACE: &str = "core:class:Space";
    pub const TX: &str = "core:class:Tx";
    pub const TX_CUD: &str = "core:class:TxCUD";
    pub const TX_CREATE_DOC: &str = "core:class:TxCreateDoc";
    pub const TX_UPDATE_DOC: &str = "core:class:TxUpdateDoc";
    pub const TX_REMOVE_DOC: &str = "core:class:TxRemoveDoc";
    pub const TX_MIXIN: &str = "core:class:TxMixin";
    pub const TX_APPLY_IF: &str = "core:class:TxApplyIf";
    pub const TX_WORKSPACE_EVENT: &str = "core:class:TxWorkspaceEvent";
    pub const PLUGIN_CONFIGURATION: &str = "core:class:PluginConfiguration";
    pub const MIGRATION_STATE: &str = "core:class:MigrationState";
    pub const PREFERENCE: &str = "core:class:Preference";
    pub const BENCHMARK_DOC: &str = "core:class:BenchmarkDoc";
    pub const TRANSIENT_DOC: &str = "core:class:TransientDoc";
}

/// Well-known spaces
pub mod spaces {
    /// Schema/model definitions live here exclusively
    pub const MODEL: &str = "core:space:Model";
    /// Space of client-submitted transactions
    pub const TX: &str = "core:space:Tx";
    /// Space of transactions produced by triggers
    pub const DERIVED_TX: &str = "core:space:DerivedTx";
    pub const CONFIGURATION: &str = "core:space:Configuration";
    pub const WORKSPACE: &str = "core:space:Workspace";
}

/// Built-in storage domains
pub mod domains {
    pub const TX: &str = "tx";
    pub const MODEL: &str = "model";
    pub const TRANSIENT: &str = "transient";
    pub const BENCHMARK: &str = "benchmark";
    pub const MIGRATION: &str = "migration";
    pub const CONFIGURATION: &str = "configuration";
    pub const PREFERENCE: &str = "preference";
}

/// Identity used by the server itself (migrations, triggers)
pub const SYSTEM_ACCOUNT: &str = "core:account:System";

/// Account role within a workspace, ordered by privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountRole {
    DocGuest,
    Guest,
    User,
    Maintainer,
    Owner,
}

impl Default for AccountRole {
    fn default() -> Self {
        AccountRole::User
    }
}

/// Current wall-clock time in milliseconds
pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique document id.
///
/// 24 hex chars of BLAKE3 over (time, pid, counter); sortable prefix is not
/// guaranteed, uniqueness is.
pub fn generate_id() -> Ref {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = blake3::Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&counter.to_le_bytes());
    let hash = hasher.finalize();
    hash.to_hex()[..24].to_string()
}
