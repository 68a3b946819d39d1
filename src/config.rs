//! Server configuration
//!
//! Every field has a default, so an empty YAML document is a valid config.
//! The binary loads the file (if given) and applies CLI overrides on top.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::metrics::SLOW_REQUEST_THRESHOLD_MS;
use crate::migration::IndexMode;
use crate::model::{domains, Domain};
use crate::session::{AccountDirectory, AccountEntry, SessionConfig, DEFAULT_BROADCAST_THRESHOLD};
use crate::workspace_manager::WorkspaceOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Workspaces opened at startup
    pub workspaces: Vec<String>,
    pub broadcast_threshold: usize,
    pub find_chunk_size: usize,
    pub backup_chunk_docs: usize,
    pub allow_upload: bool,
    pub slow_request_ms: u64,
    pub metrics: bool,
    pub index_mode: IndexMode,
    pub private_domains: Vec<Domain>,
    /// Token credentials; the only way to a system or owner session
    pub accounts: Vec<AccountEntry>,
    /// Accept tokenless `hello` as a plain user of the named account
    pub open_accounts: bool,
    /// Threads handling requests of one connection
    pub request_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/txsync.sock"),
            workspaces: Vec::new(),
            broadcast_threshold: DEFAULT_BROADCAST_THRESHOLD,
            find_chunk_size: 1000,
            backup_chunk_docs: 500,
            allow_upload: false,
            slow_request_ms: SLOW_REQUEST_THRESHOLD_MS,
            metrics: true,
            index_mode: IndexMode::Perform,
            private_domains: vec![domains::PREFERENCE.to_string()],
            accounts: Vec::new(),
            open_accounts: true,
            request_workers: 4,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: ServerConfig = if text.trim().is_empty() {
            ServerConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broadcast_threshold == 0 {
            return Err(SyncError::Config("broadcast_threshold must be positive".to_string()));
        }
        if self.find_chunk_size == 0 {
            return Err(SyncError::Config("find_chunk_size must be positive".to_string()));
        }
        if self.backup_chunk_docs == 0 {
            return Err(SyncError::Config("backup_chunk_docs must be positive".to_string()));
        }
        if self.request_workers == 0 {
            return Err(SyncError::Config("request_workers must be positive".to_string()));
        }
        let mut tokens = std::collections::HashSet::new();
        for entry in &self.accounts {
            if entry.token.is_empty() || !tokens.insert(entry.token.as_str()) {
                return Err(SyncError::Config(format!(
                    "account {} needs a unique, non-empty token",
                    entry.account
                )));
            }
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            find_chunk_size: self.find_chunk_size,
            backup_chunk_docs: self.backup_chunk_docs,
            allow_upload: self.allow_upload,
        }
    }

    pub fn account_directory(&self) -> AccountDirectory {
        AccountDirectory::from_entries(&self.accounts, self.open_accounts)
    }

    pub fn workspace_options(&self) -> WorkspaceOptions {
        WorkspaceOptions {
            broadcast_threshold: self.broadcast_threshold,
            private_domains: self.private_domains.clone(),
        }
    }
}
