//! txsync - transaction synchronization core
//!
//! Clients connect over a framed socket, say `hello` to bind a session to a
//! workspace, then query and submit transactions. Every call runs through
//! the workspace's middleware pipeline (authorization guards, model checks,
//! triggers) down to a pluggable store, and applied transactions are
//! broadcast to the other sessions of the workspace. The migration module
//! upgrades a workspace's model and data while it is live.

pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod migration;
pub mod model;
pub mod pipeline;
pub mod session;
pub mod storage;
pub mod workspace_manager;

pub use codec::{Request, Response};
pub use config::ServerConfig;
pub use error::{Result, SyncError};
pub use model::{Doc, Tx, TxFactory};
pub use pipeline::{Pipeline, PipelineContext, SessionContext};
pub use session::Session;
pub use storage::{MemoryAdapter, StoreAdapter};
pub use workspace_manager::{TransactorControl, Workspace, WorkspaceManager};
