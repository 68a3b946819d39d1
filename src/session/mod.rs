//! Client session
//!
//! One `Session` per connection. After `hello` binds it to a workspace and an
//! identity, every request is dispatched by method name, run through the
//! workspace pipeline and answered on the session's socket. Failures become
//! error responses carrying the request id; only undecodable frames end the
//! connection, and that is the server loop's call.
//!
//! A `tx` call is answered in a fixed order:
//!
//! 1. the store result goes back to the caller
//! 2. the applied transactions are broadcast to the other sessions
//! 3. deferred tasks run under a fresh correlation id
//! 4. whatever those produced is broadcast to everyone

pub mod auth;
pub mod backup;
pub mod socket;
pub mod stats;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::codec::{ChunkInfo, Request, Response};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::middleware::Identity;
use crate::model::{
    domains, now_ms, Doc, DocumentQuery, FindOptions, FindResult, Ref, SearchOptions,
    SearchQuery, Timestamp, Tx, WorkspaceEvent,
};
use crate::pipeline::{DeferredTask, Pipeline, SessionContext};
use crate::workspace_manager::{SessionHandle, Workspace, WorkspaceManager};

pub use auth::{AccountDirectory, AccountEntry, AccountResolver};
pub use backup::{BackupOps, DocChunk};
pub use socket::{ChannelSocket, Outbound, Socket};
pub use stats::{SessionStats, SessionStatsSnapshot};

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Broadcast batches larger than this collapse into one bulk-update event
pub const DEFAULT_BROADCAST_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Max documents per `findAll` response when chunking was negotiated
    pub find_chunk_size: usize,
    pub backup_chunk_docs: usize,
    /// Lets non-system accounts request `allowUpload`
    pub allow_upload: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            find_chunk_size: 1000,
            backup_chunk_docs: 500,
            allow_upload: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connected,
    Active,
    Closing,
    Closed,
}

/// What a client sends in `hello`. The account is only a claim; the
/// workspace manager's resolver decides the identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloParams {
    pub workspace: String,
    #[serde(default)]
    pub account: Ref,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub chunking: bool,
    #[serde(default)]
    pub allow_upload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    pub server_version: String,
    pub last_tx: Option<Ref>,
    pub last_hash: String,
    pub account: Identity,
    pub binary: bool,
    /// Frames are never compressed, so this is always false
    pub compression: bool,
    pub chunking: bool,
    pub allow_upload: bool,
}

/// What `hello` negotiated
struct Binding {
    workspace: Arc<Workspace>,
    identity: Identity,
    chunking: bool,
    allow_upload: bool,
}

enum Reply {
    Value(Value),
    /// The handler already answered (possibly in several frames)
    Sent,
}

struct Call<'a> {
    request: &'a Request,
    started: Instant,
}

pub struct Session {
    id: String,
    socket: Arc<dyn Socket>,
    manager: Arc<WorkspaceManager>,
    config: SessionConfig,
    metrics: Option<Arc<Metrics>>,
    state: Mutex<SessionState>,
    binding: RwLock<Option<Arc<Binding>>>,
    last_request: AtomicI64,
    in_flight: AtomicUsize,
    stats: Arc<SessionStats>,
    backup: Mutex<Option<BackupOps>>,
}

impl Session {
    pub fn new(
        socket: Arc<dyn Socket>,
        manager: Arc<WorkspaceManager>,
        config: SessionConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            id: socket.id().to_string(),
            socket,
            manager,
            config,
            metrics,
            state: Mutex::new(SessionState::Connected),
            binding: RwLock::new(None),
            last_request: AtomicI64::new(now_ms()),
            in_flight: AtomicUsize::new(0),
            stats: Arc::new(SessionStats::new()),
            backup: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.binding.read().as_ref().map(|b| b.identity.clone())
    }

    pub fn workspace(&self) -> Option<String> {
        self.binding.read().as_ref().map(|b| b.workspace.name().to_string())
    }

    pub fn last_request(&self) -> Timestamp {
        self.last_request.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Pipeline instance the backup handle is bound to, if one exists
    pub fn backup_instance(&self) -> Option<u64> {
        self.backup.lock().as_ref().map(|ops| ops.pipeline_instance())
    }

    /// Handle one decoded request; every outcome is reported on the socket.
    pub fn handle(&self, request: &Request) {
        let call = Call {
            request,
            started: Instant::now(),
        };
        self.last_request.store(now_ms(), Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        match self.dispatch(&call) {
            Ok(Reply::Value(value)) => self.respond(&call, Response::ok(request.id.clone(), value)),
            Ok(Reply::Sent) => {}
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_error();
                }
                if e.is_authorization() {
                    warn!(session = %self.id, method = %request.method, error = %e, "request rejected");
                } else {
                    error!(session = %self.id, method = %request.method, error = %e, "request failed");
                }
                self.respond(&call, Response::error(request.id.clone(), &e));
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let elapsed_ms = call.started.elapsed().as_millis() as u64;
        if let Some(metrics) = &self.metrics {
            if metrics.record_request(&request.method, elapsed_ms) {
                warn!(session = %self.id, method = %request.method, elapsed_ms, "slow request");
            }
        }
    }

    fn dispatch(&self, call: &Call<'_>) -> Result<Reply> {
        let request = call.request;
        if request.method == "hello" {
            return self.hello(call);
        }

        let binding = self.binding()?;
        match request.method.as_str() {
            "ping" => Ok(Reply::Value(json!("pong!"))),
            "loadModel" => {
                let last: Option<Timestamp> = request.param(0)?;
                let hash: Option<String> = request.param(1)?;
                let pipeline = binding.workspace.pipeline();
                let model = pipeline.load_model(last.unwrap_or(0), hash.as_deref());
                Ok(Reply::Value(serde_json::to_value(model)?))
            }
            "findAll" => self.find_all(call, &binding),
            "searchFulltext" => {
                let query: SearchQuery = request.param(0)?;
                let options: Option<SearchOptions> = request.param(1)?;
                self.stats.find.inc();
                let mut ctx = self.context(&binding);
                let result = binding.workspace.pipeline().search_fulltext(
                    &mut ctx,
                    &query,
                    &options.unwrap_or_default(),
                )?;
                Ok(Reply::Value(serde_json::to_value(result)?))
            }
            "tx" => {
                let tx: Tx = request.param(0)?;
                self.stats.tx.inc();
                let pipeline = binding.workspace.pipeline();
                let mut ctx = self.context(&binding);
                let outcome = pipeline.submit(&mut ctx, &tx)?;
                let result = serde_json::to_value(&outcome.result)?;
                self.finish_write(call, &binding, &pipeline, &ctx, result, outcome.derived, outcome.deferred)
            }
            "domainRequest" => {
                let domain: String = request.param(0)?;
                let params: Value = request.param(1)?;
                self.stats.tx.inc();
                let pipeline = binding.workspace.pipeline();
                let mut ctx = self.context(&binding);
                let outcome = pipeline.domain_request(&mut ctx, &domain, &params)?;
                self.finish_write(call, &binding, &pipeline, &ctx, outcome.result, outcome.derived, outcome.deferred)
            }
            "loadChunk" => {
                let domain: String = request.param(0)?;
                let idx: Option<u64> = request.param(1)?;
                Self::check_raw_access(&binding, &domain)?;
                let chunk = self.with_backup(&binding, |ops| ops.load_chunk(&domain, idx))?;
                Ok(Reply::Value(serde_json::to_value(chunk)?))
            }
            "closeChunk" => {
                let idx: u64 = request.param(0)?;
                self.with_backup(&binding, |ops| ops.close_chunk(idx))?;
                Ok(Reply::Value(Value::Null))
            }
            "getDomainHash" => {
                let domain: String = request.param(0)?;
                Self::check_raw_access(&binding, &domain)?;
                let hash = self.with_backup(&binding, |ops| ops.domain_hash(&domain))?;
                Ok(Reply::Value(Value::String(hash)))
            }
            "loadDocs" => {
                let domain: String = request.param(0)?;
                let ids: Vec<Ref> = request.param(1)?;
                Self::check_raw_access(&binding, &domain)?;
                let docs = self.with_backup(&binding, |ops| ops.load_docs(&domain, &ids))?;
                Ok(Reply::Value(serde_json::to_value(docs)?))
            }
            "upload" => {
                if !binding.allow_upload {
                    return Ok(Reply::Value(not_allowed()));
                }
                let domain: String = request.param(0)?;
                let docs: Vec<Doc> = request.param(1)?;
                Self::check_raw_access(&binding, &domain)?;
                let count = docs.len();
                self.with_backup(&binding, |ops| ops.upload(&domain, docs))?;
                info!(session = %self.id, domain = %domain, count, "documents uploaded");
                Ok(Reply::Value(Value::Null))
            }
            "clean" => {
                if !binding.allow_upload {
                    return Ok(Reply::Value(not_allowed()));
                }
                let domain: String = request.param(0)?;
                let ids: Vec<Ref> = request.param(1)?;
                Self::check_raw_access(&binding, &domain)?;
                self.with_backup(&binding, |ops| ops.clean(&domain, &ids))?;
                info!(session = %self.id, domain = %domain, count = ids.len(), "documents cleaned");
                Ok(Reply::Value(Value::Null))
            }
            "getStatistics" => Ok(Reply::Value(json!({
                "session": self.stats.snapshot(),
                "server": self.metrics.as_ref().map(|m| m.snapshot()),
            }))),
            other => Err(SyncError::UnknownMethod(other.to_string())),
        }
    }

    fn hello(&self, call: &Call<'_>) -> Result<Reply> {
        let params: HelloParams = call.request.param(0)?;
        if self.state() != SessionState::Connected {
            return Err(SyncError::InvalidParams {
                method: "hello".to_string(),
                reason: "session already initialized".to_string(),
            });
        }

        let workspace = self.manager.get(&params.workspace)?;
        let identity = self.manager.resolve_account(&params)?;
        let allow_upload = params.allow_upload && (identity.is_system() || self.config.allow_upload);

        let (last_tx, last_hash) = {
            let pipeline = workspace.pipeline();
            let model = pipeline.context().model.read();
            (model.txes().last().map(|tx| tx.id.clone()), model.hash())
        };
        let response = HelloResponse {
            server_version: SERVER_VERSION.to_string(),
            last_tx,
            last_hash,
            account: identity.clone(),
            binary: params.binary,
            compression: false,
            chunking: params.chunking,
            allow_upload,
        };

        workspace.register(SessionHandle {
            id: self.id.clone(),
            identity: identity.clone(),
            socket: Arc::clone(&self.socket),
            stats: Arc::clone(&self.stats),
        });
        info!(
            session = %self.id,
            workspace = %workspace.name(),
            account = %identity.account,
            role = ?identity.role,
            binary = params.binary,
            "session started"
        );
        *self.binding.write() = Some(Arc::new(Binding {
            workspace,
            identity,
            chunking: params.chunking,
            allow_upload,
        }));
        *self.state.lock() = SessionState::Active;

        // the hello answer itself is always text
        self.respond(call, Response::ok(call.request.id.clone(), serde_json::to_value(response)?));
        self.socket.set_binary(params.binary);
        Ok(Reply::Sent)
    }

    fn find_all(&self, call: &Call<'_>, binding: &Binding) -> Result<Reply> {
        let request = call.request;
        let class: Ref = request.param(0)?;
        let query: Option<DocumentQuery> = request.param(1)?;
        let options: Option<FindOptions> = request.param(2)?;
        self.stats.find.inc();

        let mut ctx = self.context(binding);
        let result = binding.workspace.pipeline().find_all(
            &mut ctx,
            &class,
            &query.unwrap_or_default(),
            &options.unwrap_or_default(),
        )?;

        let chunk_size = self.config.find_chunk_size.max(1);
        if !binding.chunking || result.len() <= chunk_size {
            return Ok(Reply::Value(serde_json::to_value(result)?));
        }

        let FindResult {
            value,
            total,
            mut lookup_map,
        } = result;
        let count = value.len().div_ceil(chunk_size);
        debug!(session = %self.id, class = %class, docs = value.len(), chunks = count, "chunked findAll");
        for (index, docs) in value.chunks(chunk_size).enumerate() {
            let part = FindResult {
                value: docs.to_vec(),
                total,
                lookup_map: lookup_map.take(),
            };
            let mut response = Response::ok(request.id.clone(), serde_json::to_value(part)?);
            response.chunk = Some(ChunkInfo {
                index: index as u32,
                is_final: index + 1 == count,
            });
            self.respond(call, response);
        }
        Ok(Reply::Sent)
    }

    /// Answer a mutating call, then broadcast and run follow-ups.
    #[allow(clippy::too_many_arguments)]
    fn finish_write(
        &self,
        call: &Call<'_>,
        binding: &Binding,
        pipeline: &Pipeline,
        ctx: &SessionContext,
        result: Value,
        derived: Vec<Tx>,
        deferred: Vec<DeferredTask>,
    ) -> Result<Reply> {
        self.respond(call, Response::ok(call.request.id.clone(), result));
        self.broadcast_txes(binding, pipeline, ctx, derived, Some(&self.id));

        pipeline.run_deferred(ctx, deferred, |follow_up, produced| {
            self.broadcast_txes(binding, pipeline, follow_up, produced, None)
        });
        Ok(Reply::Sent)
    }

    /// Fan `txes` out to the other sessions of this workspace.
    pub fn broadcast(&self, txes: Vec<Tx>) -> Result<()> {
        let binding = self.binding()?;
        let pipeline = binding.workspace.pipeline();
        let ctx = self.context(&binding);
        self.broadcast_txes(&binding, &pipeline, &ctx, txes, Some(&self.id));
        Ok(())
    }

    fn broadcast_txes(
        &self,
        binding: &Binding,
        pipeline: &Pipeline,
        ctx: &SessionContext,
        txes: Vec<Tx>,
        exclude: Option<&str>,
    ) {
        if txes.is_empty() {
            return;
        }
        let plan = pipeline.plan_broadcast(ctx, txes);
        let reached = binding.workspace.broadcast(&plan, exclude);
        debug!(session = %self.id, txes = plan.len(), sessions = reached, "broadcast");
    }

    /// Leave the workspace and close the socket. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        if let Some(binding) = self.binding.write().take() {
            binding.workspace.unregister(&self.id);
            info!(session = %self.id, workspace = %binding.workspace.name(), "session closed");
        }
        *self.backup.lock() = None;
        self.socket.close();
        *self.state.lock() = SessionState::Closed;
    }

    fn binding(&self) -> Result<Arc<Binding>> {
        if self.state() != SessionState::Active || self.socket.is_closed() {
            return Err(SyncError::SessionNotActive);
        }
        self.binding.read().clone().ok_or(SyncError::SessionNotActive)
    }

    /// Raw backup access skips the guards, so private domains and the
    /// transaction log are reserved for the system identity.
    fn check_raw_access(binding: &Binding, domain: &str) -> Result<()> {
        if binding.identity.is_system() {
            return Ok(());
        }
        if binding.workspace.is_private_domain(domain) || domain == domains::TX {
            return Err(SyncError::Forbidden(format!("raw access to domain {}", domain)));
        }
        Ok(())
    }

    fn context(&self, binding: &Binding) -> SessionContext {
        SessionContext::new(binding.workspace.name(), binding.identity.clone()).with_session(&self.id)
    }

    /// Run `f` on the backup handle, rebuilding it if the workspace pipeline
    /// changed since it was created.
    fn with_backup<T>(&self, binding: &Binding, f: impl FnOnce(&mut BackupOps) -> Result<T>) -> Result<T> {
        let pipeline = binding.workspace.pipeline();
        let mut guard = self.backup.lock();
        if let Some(ops) = guard.as_ref() {
            if ops.pipeline_instance() != pipeline.instance_id() {
                debug!(
                    session = %self.id,
                    old = ops.pipeline_instance(),
                    new = pipeline.instance_id(),
                    "backup handle rebuilt"
                );
                *guard = None;
            }
        }
        let ops = guard.get_or_insert_with(|| BackupOps::new(&pipeline, self.config.backup_chunk_docs));
        f(ops)
    }

    fn respond(&self, call: &Call<'_>, mut response: Response) {
        if call.request.time.is_some() {
            response.time = Some(call.started.elapsed().as_millis() as i64);
        }
        response.queue = Some(self.in_flight.load(Ordering::SeqCst).saturating_sub(1));
        if let Err(e) = self.socket.send(&response) {
            debug!(session = %self.id, method = %call.request.method, error = %e, "response dropped");
        }
    }
}

fn not_allowed() -> Value {
    json!({ "error": "not allowed" })
}

/// Collapse a broadcast batch above `threshold` into one bulk-update event
/// naming every touched class.
pub fn compact_broadcast(txes: Vec<Tx>, threshold: usize) -> Vec<Tx> {
    if txes.len() <= threshold {
        return txes;
    }
    let mut classes = BTreeSet::new();
    for tx in &txes {
        classes.insert(tx.object_class.clone());
        if let Some(attached) = &tx.attached_to_class {
            classes.insert(attached.clone());
        }
    }
    vec![Tx::workspace_event(
        WorkspaceEvent::BulkUpdate,
        json!({ "_class": classes.into_iter().collect::<Vec<_>>() }),
    )]
}
