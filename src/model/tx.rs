//! Transactions
//!
//! A `Tx` is the only unit of mutation. The header identifies the target
//! object and the actor; `op` carries the concrete mutation and is tagged by
//! `_class` on the wire, so a serialized tx is also a valid document of the
//! `tx` domain.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::doc::{self, Doc};
use super::query::DocumentQuery;
use super::{classes, generate_id, now_ms, spaces, Ref, Timestamp, SYSTEM_ACCOUNT};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    #[serde(rename = "_id")]
    pub id: Ref,
    pub space: Ref,
    pub object_id: Ref,
    pub object_class: Ref,
    pub object_space: Ref,
    pub modified_on: Timestamp,
    pub modified_by: Ref,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Ref>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<Ref>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to_class: Option<Ref>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(flatten)]
    pub op: TxOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_class")]
pub enum TxOp {
    #[serde(rename = "core:class:TxCreateDoc")]
    CreateDoc { attributes: Map<String, Value> },

    #[serde(rename = "core:class:TxUpdateDoc")]
    UpdateDoc { operations: Map<String, Value> },

    #[serde(rename = "core:class:TxRemoveDoc")]
    RemoveDoc {},

    #[serde(rename = "core:class:TxMixin")]
    Mixin {
        mixin: Ref,
        attributes: Map<String, Value>,
    },

    /// Apply `txes` atomically if every `match` query finds a document and
    /// no `notMatch` query does.
    #[serde(rename = "core:class:TxApplyIf")]
    ApplyIf {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        #[serde(default, rename = "match")]
        matches: Vec<ClassQuery>,
        #[serde(default, rename = "notMatch")]
        not_matches: Vec<ClassQuery>,
        txes: Vec<Tx>,
    },

    #[serde(rename = "core:class:TxWorkspaceEvent")]
    WorkspaceEvent {
        event: WorkspaceEvent,
        #[serde(default)]
        params: Value,
    },
}

/// Query used by apply-if conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassQuery {
    #[serde(rename = "_class")]
    pub class: Ref,
    #[serde(default)]
    pub query: DocumentQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkspaceEvent {
    /// Replaces a broadcast too large to replay; params carry `_class`
    BulkUpdate,
    /// Model was upgraded; clients must reload
    Upgrade,
}

impl Tx {
    /// Class id of the concrete operation (`core:class:TxCreateDoc`, ...)
    pub fn tx_class(&self) -> &'static str {
        match self.op {
            TxOp::CreateDoc { .. } => classes::TX_CREATE_DOC,
            TxOp::UpdateDoc { .. } => classes::TX_UPDATE_DOC,
            TxOp::RemoveDoc {} => classes::TX_REMOVE_DOC,
            TxOp::Mixin { .. } => classes::TX_MIXIN,
            TxOp::ApplyIf { .. } => classes::TX_APPLY_IF,
            TxOp::WorkspaceEvent { .. } => classes::TX_WORKSPACE_EVENT,
        }
    }

    pub fn is_apply_if(&self) -> bool {
        matches!(self.op, TxOp::ApplyIf { .. })
    }

    pub fn is_workspace_event(&self) -> bool {
        matches!(self.op, TxOp::WorkspaceEvent { .. })
    }

    /// All non-composite transactions, unwrapping nested apply-if batches.
    pub fn leaves(&self) -> Vec<&Tx> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Tx>) {
        match &self.op {
            TxOp::ApplyIf { txes, .. } => {
                for tx in txes {
                    tx.collect_leaves(out);
                }
            }
            _ => out.push(self),
        }
    }

    /// Declared creator of the target record, if this tx names one.
    pub fn creator(&self) -> &Ref {
        self.created_by.as_ref().unwrap_or(&self.modified_by)
    }

    /// Document form for storage in the `tx` domain
    pub fn to_doc(&self) -> Result<Doc> {
        Doc::from_value(serde_json::to_value(self)?)
    }

    pub fn from_doc(doc: &Doc) -> Result<Tx> {
        Ok(serde_json::from_value(Value::Object(doc.0.clone()))?)
    }

    /// Materialize the document a `TxCreateDoc` describes.
    pub fn create_doc(&self) -> Result<Doc> {
        let attributes = match &self.op {
            TxOp::CreateDoc { attributes } => attributes,
            _ => {
                return Err(SyncError::Store(format!(
                    "tx {} is not a create transaction",
                    self.id
                )))
            }
        };

        let mut result = Doc::new(&self.object_id, &self.object_class, &self.object_space);
        for (k, v) in attributes {
            result.set(k, v.clone());
        }
        result.touch(&self.modified_by, self.modified_on);
        result.set(doc::CREATED_BY, Value::String(self.creator().clone()));
        result.set(doc::CREATED_ON, Value::from(self.modified_on));
        if let Some(attached_to) = &self.attached_to {
            result.set(doc::ATTACHED_TO, Value::String(attached_to.clone()));
        }
        if let Some(attached_to_class) = &self.attached_to_class {
            result.set(doc::ATTACHED_TO_CLASS, Value::String(attached_to_class.clone()));
        }
        if let Some(collection) = &self.collection {
            result.set(doc::COLLECTION, Value::String(collection.clone()));
        }
        Ok(result)
    }

    /// Compacted broadcast event naming the touched classes.
    pub fn workspace_event(event: WorkspaceEvent, params: Value) -> Tx {
        let id = generate_id();
        Tx {
            id: id.clone(),
            space: spaces::DERIVED_TX.to_string(),
            object_id: id,
            object_class: classes::TX_WORKSPACE_EVENT.to_string(),
            object_space: spaces::WORKSPACE.to_string(),
            modified_on: now_ms(),
            modified_by: SYSTEM_ACCOUNT.to_string(),
            created_by: None,
            attached_to: None,
            attached_to_class: None,
            collection: None,
            op: TxOp::WorkspaceEvent { event, params },
        }
    }
}

/// Builds transactions on behalf of one actor.
#[derive(Debug, Clone)]
pub struct TxFactory {
    account: Ref,
    derived: bool,
}

impl TxFactory {
    pub fn new(account: impl Into<Ref>) -> Self {
        Self {
            account: account.into(),
            derived: false,
        }
    }

    /// Factory for trigger/migration output (`core:space:DerivedTx`).
    pub fn derived(account: impl Into<Ref>) -> Self {
        Self {
            account: account.into(),
            derived: true,
        }
    }

    pub fn account(&self) -> &Ref {
        &self.account
    }

    fn header(&self, class: &str, space: &str, object_id: &str, op: TxOp) -> Tx {
        Tx {
            id: generate_id(),
            space: if self.derived { spaces::DERIVED_TX } else { spaces::TX }.to_string(),
            object_id: object_id.to_string(),
            object_class: class.to_string(),
            object_space: space.to_string(),
            modified_on: now_ms(),
            modified_by: self.account.clone(),
            created_by: None,
            attached_to: None,
            attached_to_class: None,
            collection: None,
            op,
        }
    }

    pub fn create_doc(&self, class: &str, space: &str, object_id: &str, attributes: Map<String, Value>) -> Tx {
        let mut tx = self.header(class, space, object_id, TxOp::CreateDoc { attributes });
        tx.created_by = Some(self.account.clone());
        tx
    }

    pub fn add_collection(
        &self,
        class: &str,
        space: &str,
        object_id: &str,
        attached_to: &str,
        attached_to_class: &str,
        collection: &str,
        attributes: Map<String, Value>,
    ) -> Tx {
        let mut tx = self.create_doc(class, space, object_id, attributes);
        tx.attached_to = Some(attached_to.to_string());
        tx.attached_to_class = Some(attached_to_class.to_string());
        tx.collection = Some(collection.to_string());
        tx
    }

    pub fn update_doc(&self, class: &str, space: &str, object_id: &str, operations: Map<String, Value>) -> Tx {
        self.header(class, space, object_id, TxOp::UpdateDoc { operations })
    }

    pub fn remove_doc(&self, class: &str, space: &str, object_id: &str) -> Tx {
        self.header(class, space, object_id, TxOp::RemoveDoc {})
    }

    pub fn mixin(&self, class: &str, space: &str, object_id: &str, mixin: &str, attributes: Map<String, Value>) -> Tx {
        self.header(
            class,
            space,
            object_id,
            TxOp::Mixin {
                mixin: mixin.to_string(),
                attributes,
            },
        )
    }

    pub fn apply_if(&self, scope: Option<&str>, matches: Vec<ClassQuery>, not_matches: Vec<ClassQuery>, txes: Vec<Tx>) -> Tx {
        let id = generate_id();
        self.header(
            classes::TX_APPLY_IF,
            spaces::TX,
            &id,
            TxOp::ApplyIf {
                scope: scope.map(str::to_string),
                matches,
                not_matches,
                txes,
            },
        )
    }
}

#[cfg(test)]
mod tx_tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_create_tx_wire_shape() {
        let factory = TxFactory::new("alice");
        let tx = factory.create_doc("tracker:class:Issue", "space-1", "issue-1", attrs(json!({ "title": "Bug" })));

        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["_class"], "core:class:TxCreateDoc");
        assert_eq!(json["objectClass"], "tracker:class:Issue");
        assert_eq!(json["objectSpace"], "space-1");
        assert_eq!(json["space"], spaces::TX);
        assert_eq!(json["attributes"]["title"], "Bug");
        assert_eq!(json["createdBy"], "alice");
        assert!(json.get("attachedTo").is_none());

        let back: Tx = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_remove_tx_round_trip() {
        let tx = TxFactory::new("alice").remove_doc("c", "s", "o");
        let json = serde_json::to_string(&tx).unwrap();
        let back: Tx = serde_json::from_str(&json).unwrap();
        assert_eq!(back.op, TxOp::RemoveDoc {});
        assert_eq!(back.tx_class(), classes::TX_REMOVE_DOC);
    }

    #[test]
    fn test_apply_if_leaves_are_flattened() {
        let f = TxFactory::new("alice");
        let inner = f.apply_if(
            None,
            vec![],
            vec![],
            vec![f.remove_doc("c", "s", "a"), f.remove_doc("c", "s", "b")],
        );
        let outer = f.apply_if(Some("scope"), vec![], vec![], vec![inner, f.remove_doc("c", "s", "c")]);

        let ids: Vec<&str> = outer.leaves().iter().map(|t| t.object_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(outer.is_apply_if());
    }

    #[test]
    fn test_create_doc_materialization() {
        let f = TxFactory::new("alice");
        let tx = f.add_collection(
            "chunter:class:Comment",
            "space-1",
            "c1",
            "issue-1",
            "tracker:class:Issue",
            "comments",
            attrs(json!({ "message": "hi" })),
        );
        let doc = tx.create_doc().unwrap();

        assert_eq!(doc.id(), Some("c1"));
        assert_eq!(doc.created_by(), Some("alice"));
        assert_eq!(doc.attached_to_class(), Some("tracker:class:Issue"));
        assert_eq!(doc.get("message"), Some(&json!("hi")));
        assert_eq!(doc.get("collection"), Some(&json!("comments")));
    }

    #[test]
    fn test_tx_doc_round_trip() {
        let tx = TxFactory::new("alice").mixin("c", "s", "o", "m", attrs(json!({ "x": 1 })));
        let doc = tx.to_doc().unwrap();
        assert_eq!(doc.class(), Some(classes::TX_MIXIN));
        assert_eq!(Tx::from_doc(&doc).unwrap(), tx);
    }

    #[test]
    fn test_derived_factory_space() {
        let tx = TxFactory::derived(SYSTEM_ACCOUNT).remove_doc("c", "s", "o");
        assert_eq!(tx.space, spaces::DERIVED_TX);
        assert_eq!(tx.modified_by, SYSTEM_ACCOUNT);
    }
}
