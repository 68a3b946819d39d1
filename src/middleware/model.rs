//! Model space enforcement
//!
//! Classes stored in the `model` domain may only be written in the model
//! space, and the model space holds nothing else. Accepted model
//! transactions are appended to the live hierarchy and model database.

use super::Middleware;
use crate::error::{Result, SyncError};
use crate::model::{domains, spaces, Hierarchy, Tx};
use crate::pipeline::{Next, SessionContext};
use crate::storage::TxResult;

#[derive(Debug, Default)]
pub struct ModelMiddleware;

impl ModelMiddleware {
    pub fn new() -> Self {
        Self
    }

    fn is_model(hierarchy: &Hierarchy, tx: &Tx) -> Result<bool> {
        Ok(hierarchy.get_domain(&tx.object_class)? == domains::MODEL)
    }

    fn check_space(hierarchy: &Hierarchy, tx: &Tx) -> Result<()> {
        if tx.is_workspace_event() {
            return Ok(());
        }
        let in_model_space = tx.object_space == spaces::MODEL;
        match (Self::is_model(hierarchy, tx)?, in_model_space) {
            (true, false) => Err(SyncError::InvalidSpace {
                class: tx.object_class.clone(),
                expected: spaces::MODEL.to_string(),
                actual: tx.object_space.clone(),
            }),
            (false, true) => Err(SyncError::InvalidSpace {
                class: tx.object_class.clone(),
                expected: "a non-model space".to_string(),
                actual: tx.object_space.clone(),
            }),
            _ => Ok(()),
        }
    }
}

impl Middleware for ModelMiddleware {
    fn name(&self) -> &'static str {
        "model"
    }

    fn tx(&self, ctx: &mut SessionContext, tx: &Tx, next: Next<'_>) -> Result<TxResult> {
        let context = next.context();
        {
            let hierarchy = context.hierarchy.read();
            for leaf in tx.leaves() {
                Self::check_space(&hierarchy, leaf)?;
            }
        }

        let result = next.tx(ctx, tx)?;
        if !result.is_applied() {
            return Ok(result);
        }

        context.append_model(
            tx.leaves()
                .into_iter()
                .filter(|leaf| leaf.object_space == spaces::MODEL),
        );
        Ok(result)
    }
}

#[cfg(test)]
mod model_middleware_tests {
    use super::*;
    use crate::model::{classes, core::class_def, core_model, Doc, FindOptions, TxFactory};
    use crate::pipeline::{Pipeline, PipelineContext};
    use crate::storage::{AdapterRegistry, MemoryAdapter};
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn pipeline() -> Pipeline {
        let mut txes = core_model();
        txes.push(class_def("task:class:Task", Some(classes::DOC), Some("task")));
        let context = Arc::new(PipelineContext::new(
            "ws",
            txes,
            AdapterRegistry::new(Arc::new(MemoryAdapter::new())),
        ));
        Pipeline::new(context, vec![Box::new(ModelMiddleware::new())])
    }

    #[test]
    fn test_class_definition_outside_model_space_rejected() {
        let p = pipeline();
        let mut ctx = SessionContext::system("ws");
        let tx = TxFactory::new("core:account:System").create_doc(classes::CLASS, "space-1", "x:class:X", Map::new());

        let err = p.submit(&mut ctx, &tx).unwrap_err();
        assert!(matches!(err, SyncError::InvalidSpace { .. }));

        let txlog = p
            .find_all(&mut ctx, classes::TX, &Map::new(), &FindOptions::default())
            .unwrap();
        assert!(txlog.is_empty());
    }

    #[test]
    fn test_regular_doc_in_model_space_rejected() {
        let p = pipeline();
        let mut ctx = SessionContext::system("ws");
        let tx = TxFactory::new("alice").create_doc("task:class:Task", spaces::MODEL, "t1", Map::new());
        assert!(matches!(p.submit(&mut ctx, &tx), Err(SyncError::InvalidSpace { .. })));
    }

    #[test]
    fn test_unknown_class_rejected() {
        let p = pipeline();
        let mut ctx = SessionContext::system("ws");
        let tx = TxFactory::new("alice").create_doc("nope:class:Nope", "s", "t1", Map::new());
        assert!(matches!(p.submit(&mut ctx, &tx), Err(SyncError::ClassNotFound(_))));
    }

    #[test]
    fn test_new_class_becomes_usable() {
        let p = pipeline();
        let mut ctx = SessionContext::system("ws");
        let hash_before = p.load_model(0, None).hash;

        let attrs = json!({ "extends": classes::DOC, "domain": "kb" }).as_object().unwrap().clone();
        let def = TxFactory::new("core:account:System").create_doc(classes::CLASS, spaces::MODEL, "kb:class:Page", attrs);
        p.submit(&mut ctx, &def).unwrap();

        let page = TxFactory::new("alice").create_doc("kb:class:Page", "s", "p1", Map::new());
        p.submit(&mut ctx, &page).unwrap();

        let found = p
            .find_all(&mut ctx, "kb:class:Page", &Map::new(), &FindOptions::default())
            .unwrap();
        assert_eq!(found.value.iter().filter_map(Doc::id).collect::<Vec<_>>(), vec!["p1"]);

        let delta = p.load_model(0, Some(&hash_before));
        assert!(!delta.full);
        assert_eq!(delta.transactions, vec![def]);
    }
}
