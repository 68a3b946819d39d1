//! Transaction origin guard
//!
//! Clients may only submit transactions in their own name. Workspace events
//! and derived-space transactions are server-issued; a client sending one
//! would forge broadcasts or dodge triggers. The system identity is exempt.

use tracing::warn;

use super::{Identity, Middleware};
use crate::error::{Result, SyncError};
use crate::model::{spaces, Tx};
use crate::pipeline::{Next, SessionContext};
use crate::storage::TxResult;

#[derive(Debug, Default)]
pub struct TxOriginGuard;

impl TxOriginGuard {
    pub fn new() -> Self {
        Self
    }

    fn check(identity: &Identity, tx: &Tx) -> Result<()> {
        if tx.is_workspace_event() {
            return Err(SyncError::Forbidden("workspace events are server-issued".to_string()));
        }
        if tx.space == spaces::DERIVED_TX {
            return Err(SyncError::Forbidden(format!("tx {} claims the derived space", tx.id)));
        }
        if !identity.matches(&tx.modified_by) {
            return Err(SyncError::Forbidden(format!(
                "tx {} is attributed to {}",
                tx.id, tx.modified_by
            )));
        }
        if let Some(creator) = &tx.created_by {
            if !identity.matches(creator) {
                return Err(SyncError::Forbidden(format!("tx {} names creator {}", tx.id, creator)));
            }
        }
        Ok(())
    }
}

impl Middleware for TxOriginGuard {
    fn name(&self) -> &'static str {
        "tx-origin"
    }

    fn tx(&self, ctx: &mut SessionContext, tx: &Tx, next: Next<'_>) -> Result<TxResult> {
        if !ctx.identity.is_system() {
            let outer = std::iter::once(tx).filter(|t| t.is_apply_if());
            for t in outer.chain(tx.leaves()) {
                if let Err(e) = Self::check(&ctx.identity, t) {
                    warn!(
                        workspace = %ctx.workspace,
                        account = %ctx.identity.account,
                        tx = %t.id,
                        error = %e,
                        "tx rejected"
                    );
                    return Err(e);
                }
            }
        }
        next.tx(ctx, tx)
    }
}

#[cfg(test)]
mod origin_tests {
    use super::*;
    use crate::model::{classes, core::class_def, core_model, AccountRole, TxFactory, WorkspaceEvent};
    use crate::pipeline::{Pipeline, PipelineContext};
    use crate::storage::{AdapterRegistry, MemoryAdapter};
    use serde_json::{json, Map};
    use std::sync::Arc;

    const TASK: &str = "task:class:Task";

    fn pipeline() -> Pipeline {
        let mut txes = core_model();
        txes.push(class_def(TASK, Some(classes::DOC), Some("task")));
        let context = Arc::new(PipelineContext::new(
            "ws",
            txes,
            AdapterRegistry::new(Arc::new(MemoryAdapter::new())),
        ));
        Pipeline::new(context, vec![Box::new(TxOriginGuard::new())])
    }

    fn alice() -> SessionContext {
        SessionContext::new("ws", Identity::new("alice", AccountRole::User))
    }

    #[test]
    fn test_own_tx_passes() {
        let tx = TxFactory::new("alice").create_doc(TASK, "space-1", "t1", Map::new());
        assert!(pipeline().submit(&mut alice(), &tx).is_ok());
    }

    #[test]
    fn test_foreign_attribution_rejected() {
        let p = pipeline();
        let tx = TxFactory::new("bob").create_doc(TASK, "space-1", "t1", Map::new());
        assert!(matches!(p.submit(&mut alice(), &tx), Err(SyncError::Forbidden(_))));

        let mut forged = TxFactory::new("alice").create_doc(TASK, "space-1", "t2", Map::new());
        forged.created_by = Some("bob".to_string());
        assert!(p.submit(&mut alice(), &forged).is_err());
    }

    #[test]
    fn test_server_only_shapes_rejected() {
        let p = pipeline();
        let mut event = Tx::workspace_event(WorkspaceEvent::BulkUpdate, json!({ "_class": [TASK] }));
        event.modified_by = "alice".to_string();
        assert!(p.submit(&mut alice(), &event).is_err());

        let derived = TxFactory::derived("alice").create_doc(TASK, "space-1", "t3", Map::new());
        assert!(p.submit(&mut alice(), &derived).is_err());

        // nested inside an apply-if batch
        let inner = TxFactory::derived("alice").create_doc(TASK, "space-1", "t4", Map::new());
        let batch = TxFactory::new("alice").apply_if(None, Vec::new(), Vec::new(), vec![inner]);
        assert!(p.submit(&mut alice(), &batch).is_err());

        assert!(p.submit(&mut SessionContext::system("ws"), &derived).is_ok());
    }
}
