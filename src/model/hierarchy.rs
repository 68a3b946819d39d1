//! Class hierarchy
//!
//! Built incrementally from model transactions. Each class has at most one
//! parent (`extends`); the storage domain of a class is the nearest `domain`
//! declared along its ancestor chain.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tx::{Tx, TxOp};
use super::{classes, Domain, Ref};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClassKind {
    Class,
    Mixin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassInfo {
    pub id: Ref,
    pub kind: ClassKind,
    pub extends: Option<Ref>,
    pub domain: Option<Domain>,
}

#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    classes: HashMap<Ref, ClassInfo>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a hierarchy by replaying model transactions in order.
    pub fn from_txes<'a>(txes: impl IntoIterator<Item = &'a Tx>) -> Self {
        let mut hierarchy = Self::new();
        for tx in txes {
            hierarchy.tx(tx);
        }
        hierarchy
    }

    /// Apply one model transaction. Non-class transactions are ignored.
    pub fn tx(&mut self, tx: &Tx) {
        let kind = match tx.object_class.as_str() {
            classes::CLASS => ClassKind::Class,
            classes::MIXIN => ClassKind::Mixin,
            _ => return,
        };

        match &tx.op {
            TxOp::CreateDoc { attributes } => {
                let info = ClassInfo {
                    id: tx.object_id.clone(),
                    kind,
                    extends: attributes.get("extends").and_then(Value::as_str).map(str::to_string),
                    domain: attributes.get("domain").and_then(Value::as_str).map(str::to_string),
                };
                self.classes.insert(tx.object_id.clone(), info);
            }
            TxOp::UpdateDoc { operations } => {
                if let Some(info) = self.classes.get_mut(&tx.object_id) {
                    if let Some(domain) = operations.get("domain").and_then(Value::as_str) {
                        info.domain = Some(domain.to_string());
                    }
                }
            }
            TxOp::RemoveDoc {} => {
                self.classes.remove(&tx.object_id);
            }
            _ => {}
        }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    pub fn class(&self, class: &str) -> Result<&ClassInfo> {
        self.classes
            .get(class)
            .ok_or_else(|| SyncError::ClassNotFound(class.to_string()))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Ancestor chain starting with `class` itself.
    pub fn ancestors(&self, class: &str) -> Vec<&ClassInfo> {
        let mut chain = Vec::new();
        let mut current = self.classes.get(class);
        while let Some(info) = current {
            // guard against a malformed model with a cycle
            if chain.iter().any(|c: &&ClassInfo| c.id == info.id) {
                break;
            }
            chain.push(info);
            current = info.extends.as_deref().and_then(|p| self.classes.get(p));
        }
        chain
    }

    /// True when `class` is `base` or one of its descendants.
    pub fn is_derived(&self, class: &str, base: &str) -> bool {
        class == base || self.ancestors(class).iter().any(|c| c.id == base)
    }

    pub fn find_domain(&self, class: &str) -> Option<&Domain> {
        self.ancestors(class).into_iter().find_map(|c| c.domain.as_ref())
    }

    /// Storage domain of a class; unknown classes are an error.
    pub fn get_domain(&self, class: &str) -> Result<Domain> {
        self.class(class)?;
        self.find_domain(class)
            .cloned()
            .ok_or_else(|| SyncError::ClassNotFound(format!("{} (no domain)", class)))
    }

    /// Every domain declared by some class
    pub fn domains(&self) -> BTreeSet<Domain> {
        self.classes.values().filter_map(|c| c.domain.clone()).collect()
    }

    /// `class` and all classes deriving from it
    pub fn descendants(&self, class: &str) -> Vec<Ref> {
        let mut result: Vec<Ref> = self
            .classes
            .keys()
            .filter(|id| self.is_derived(id, class))
            .cloned()
            .collect();
        result.sort();
        result
    }
}

#[cfg(test)]
mod hierarchy_tests {
    use super::*;
    use crate::model::{spaces, TxFactory};
    use serde_json::{json, Map};

    fn class_tx(f: &TxFactory, id: &str, attributes: Value) -> Tx {
        let attributes: Map<String, Value> = attributes.as_object().unwrap().clone();
        f.create_doc(classes::CLASS, spaces::MODEL, id, attributes)
    }

    fn sample() -> Hierarchy {
        let f = TxFactory::new("core:account:System");
        Hierarchy::from_txes(&[
            class_tx(&f, classes::DOC, json!({})),
            class_tx(&f, "task:class:Task", json!({ "extends": classes::DOC, "domain": "task" })),
            class_tx(&f, "task:class:Bug", json!({ "extends": "task:class:Task" })),
            class_tx(&f, "kb:class:Page", json!({ "extends": classes::DOC, "domain": "kb" })),
        ])
    }

    #[test]
    fn test_domain_inherited_from_parent() {
        let h = sample();
        assert_eq!(h.get_domain("task:class:Bug").unwrap(), "task");
        assert_eq!(h.get_domain("kb:class:Page").unwrap(), "kb");
    }

    #[test]
    fn test_unknown_class() {
        let h = sample();
        assert!(matches!(h.get_domain("nope"), Err(SyncError::ClassNotFound(_))));
        // known, but no domain anywhere in the chain
        assert!(h.get_domain(classes::DOC).is_err());
    }

    #[test]
    fn test_is_derived_and_descendants() {
        let h = sample();
        assert!(h.is_derived("task:class:Bug", classes::DOC));
        assert!(h.is_derived("task:class:Bug", "task:class:Bug"));
        assert!(!h.is_derived("kb:class:Page", "task:class:Task"));
        assert_eq!(h.descendants("task:class:Task"), vec!["task:class:Bug", "task:class:Task"]);
    }

    #[test]
    fn test_domains_and_update() {
        let mut h = sample();
        assert_eq!(h.domains().into_iter().collect::<Vec<_>>(), vec!["kb", "task"]);

        let f = TxFactory::new("core:account:System");
        let ops = json!({ "domain": "issues" }).as_object().unwrap().clone();
        h.tx(&f.update_doc(classes::CLASS, spaces::MODEL, "task:class:Task", ops));
        assert_eq!(h.get_domain("task:class:Bug").unwrap(), "issues");

        h.tx(&f.remove_doc(classes::CLASS, spaces::MODEL, "kb:class:Page"));
        assert!(!h.has_class("kb:class:Page"));
    }
}
