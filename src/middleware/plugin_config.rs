//! Plugin configuration guard
//!
//! Only the system identity and workspace owners may touch plugin
//! configuration documents. Apply-if batches are checked member by member
//! and rejected as a whole.

use tracing::warn;

use super::{Identity, Middleware};
use crate::error::{Result, SyncError};
use crate::model::{classes, AccountRole, Tx};
use crate::pipeline::{Next, SessionContext};
use crate::storage::TxResult;

#[derive(Debug, Default)]
pub struct PluginConfigurationGuard;

impl PluginConfigurationGuard {
    pub fn new() -> Self {
        Self
    }

    fn is_privileged(identity: &Identity) -> bool {
        identity.is_system() || identity.role == AccountRole::Owner
    }
}

impl Middleware for PluginConfigurationGuard {
    fn name(&self) -> &'static str {
        "plugin-configuration"
    }

    fn tx(&self, ctx: &mut SessionContext, tx: &Tx, next: Next<'_>) -> Result<TxResult> {
        if !Self::is_privileged(&ctx.identity) {
            let hierarchy = next.context().hierarchy.read();
            let touched = tx
                .leaves()
                .into_iter()
                .find(|leaf| hierarchy.is_derived(&leaf.object_class, classes::PLUGIN_CONFIGURATION));
            if let Some(leaf) = touched {
                warn!(
                    workspace = %ctx.workspace,
                    account = %ctx.identity.account,
                    object = %leaf.object_id,
                    "plugin configuration change rejected"
                );
                return Err(SyncError::Forbidden(format!(
                    "plugin configuration {} may only be changed by an owner",
                    leaf.object_id
                )));
            }
        }
        next.tx(ctx, tx)
    }
}
