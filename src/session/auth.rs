//! Account resolution for `hello`
//!
//! The identity a session acts under is decided here, never taken from the
//! handshake as-is. A client proves who it is with a token; the directory
//! maps tokens to identities. In open mode a client without a token may
//! still name a plain account and is bound to it as an ordinary user, with
//! no social ids and no elevated role. The system account is only reachable
//! through a token.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::HelloParams;
use crate::error::{Result, SyncError};
use crate::middleware::Identity;
use crate::model::{AccountRole, Ref, SYSTEM_ACCOUNT};

pub trait AccountResolver: Send + Sync {
    fn resolve(&self, hello: &HelloParams) -> Result<Identity>;
}

/// One configured credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AccountEntry {
    pub token: String,
    pub account: Ref,
    #[serde(default)]
    pub role: AccountRole,
    #[serde(default)]
    pub social_ids: Vec<Ref>,
}

impl AccountEntry {
    pub fn identity(&self) -> Identity {
        Identity::new(self.account.clone(), self.role).with_social_ids(self.social_ids.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccountDirectory {
    tokens: HashMap<String, Identity>,
    open: bool,
}

impl AccountDirectory {
    /// Tokens only
    pub fn closed() -> Self {
        Self::default()
    }

    /// Tokens, plus tokenless plain-user sessions
    pub fn open() -> Self {
        Self {
            tokens: HashMap::new(),
            open: true,
        }
    }

    pub fn from_entries(entries: &[AccountEntry], open: bool) -> Self {
        let mut directory = Self {
            tokens: HashMap::new(),
            open,
        };
        for entry in entries {
            directory.tokens.insert(entry.token.clone(), entry.identity());
        }
        directory
    }

    pub fn with_token(mut self, token: &str, identity: Identity) -> Self {
        self.tokens.insert(token.to_string(), identity);
        self
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl AccountResolver for AccountDirectory {
    fn resolve(&self, hello: &HelloParams) -> Result<Identity> {
        if let Some(token) = &hello.token {
            return self.tokens.get(token).cloned().ok_or_else(|| {
                warn!(workspace = %hello.workspace, "unknown token");
                SyncError::Unauthorized("unknown token".to_string())
            });
        }
        if !self.open {
            return Err(SyncError::Unauthorized("token required".to_string()));
        }
        if hello.account.is_empty() {
            return Err(SyncError::Unauthorized("account required".to_string()));
        }
        if hello.account == SYSTEM_ACCOUNT {
            warn!(workspace = %hello.workspace, "tokenless system account claim");
            return Err(SyncError::Unauthorized("system account requires a token".to_string()));
        }
        Ok(Identity::new(hello.account.clone(), AccountRole::User))
    }
}
