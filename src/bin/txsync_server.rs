//! txsync-server - Unix socket front end for the sync core
//!
//! Per client: a reader thread, a writer thread and a few request workers.
//! The reader decodes frames and hands requests to the workers, so a slow
//! call does not hold up the next one; responses may therefore arrive out
//! of request order, matched by id. `hello` runs on the reader itself since
//! it decides how the following frames are decoded. The writer drains the
//! session's outbound queue, which also carries broadcasts from other
//! sessions.

use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use txsync::codec::{self, Request, Response};
use txsync::config::ServerConfig;
use txsync::metrics::Metrics;
use txsync::migration::{IndexMode, MigrationOrchestrator};
use txsync::model::core_model;
use txsync::session::{ChannelSocket, Outbound, Session, SessionConfig, Socket};
use txsync::workspace_manager::WorkspaceManager;
use txsync::{SyncError, TransactorControl};

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// How often per-session usage counters roll over
const STATS_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Parser, Debug)]
#[command(name = "txsync-server", version, about = "Transaction synchronization server")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unix socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Workspace to open at startup (repeatable)
    #[arg(long = "workspace")]
    workspaces: Vec<String>,

    /// Broadcast batches above this size are compacted
    #[arg(long)]
    broadcast_threshold: Option<usize>,

    /// Documents per findAll chunk when chunking is negotiated
    #[arg(long)]
    find_chunk_size: Option<usize>,

    /// Let non-system sessions request allowUpload
    #[arg(long)]
    allow_upload: bool,

    #[arg(long)]
    slow_request_ms: Option<u64>,

    /// perform | skip | disable
    #[arg(long, value_parser = parse_index_mode)]
    index_mode: Option<IndexMode>,

    /// Disable request metrics
    #[arg(long)]
    no_metrics: bool,
}

fn parse_index_mode(s: &str) -> std::result::Result<IndexMode, String> {
    serde_yaml::from_str(s).map_err(|_| format!("unknown index mode '{}'", s))
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        config.workspaces.extend(self.workspaces);
        if let Some(n) = self.broadcast_threshold {
            config.broadcast_threshold = n;
        }
        if let Some(n) = self.find_chunk_size {
            config.find_chunk_size = n;
        }
        if self.allow_upload {
            config.allow_upload = true;
        }
        if let Some(ms) = self.slow_request_ms {
            config.slow_request_ms = ms;
        }
        if let Some(mode) = self.index_mode {
            config.index_mode = mode;
        }
        if self.no_metrics {
            config.metrics = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,txsync=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Cli::parse().into_config()?;
    info!(version = env!("CARGO_PKG_VERSION"), socket = %config.socket_path.display(), "starting txsync-server");

    let metrics = config
        .metrics
        .then(|| Arc::new(Metrics::with_slow_threshold(config.slow_request_ms)));
    let accounts = config.account_directory();
    if accounts.is_open() {
        warn!("open account mode: tokenless clients are bound as plain users");
    }
    let manager = Arc::new(
        WorkspaceManager::new(config.workspace_options()).with_account_resolver(Arc::new(accounts)),
    );

    for name in &config.workspaces {
        let workspace = manager
            .create_workspace(name, Vec::new())
            .with_context(|| format!("failed to open workspace '{}'", name))?;
        let control: Arc<dyn TransactorControl> = manager.clone();
        MigrationOrchestrator::new(workspace, control)
            .with_index_mode(config.index_mode)
            .run(core_model())
            .with_context(|| format!("failed to migrate workspace '{}'", name))?;
    }

    // Stale socket from a previous run
    let _ = std::fs::remove_file(&config.socket_path);
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    info!(socket = %config.socket_path.display(), "listening");

    spawn_signal_handler(Arc::clone(&manager), metrics.clone(), config.socket_path.clone())?;
    spawn_stats_roll_over(Arc::clone(&manager));

    let session_config = config.session_config();
    let workers = config.request_workers;
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
                let manager = Arc::clone(&manager);
                let metrics = metrics.clone();
                let session_config = session_config.clone();
                thread::spawn(move || handle_client(stream, manager, session_config, metrics, workers, client_id));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    Ok(())
}

fn spawn_signal_handler(
    manager: Arc<WorkspaceManager>,
    metrics: Option<Arc<Metrics>>,
    socket_path: PathBuf,
) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to register signal handlers")?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "shutting down");
            let closed = manager.shutdown();
            info!(sessions = closed, "sessions closed");
            if let Some(metrics) = &metrics {
                match serde_json::to_string(&metrics.snapshot()) {
                    Ok(snapshot) => info!(metrics = %snapshot, "final metrics"),
                    Err(e) => warn!(error = %e, "metrics snapshot failed"),
                }
            }
            let _ = std::fs::remove_file(&socket_path);
            std::process::exit(0);
        }
    });
    Ok(())
}

fn spawn_stats_roll_over(manager: Arc<WorkspaceManager>) {
    thread::spawn(move || loop {
        thread::sleep(STATS_PERIOD);
        manager.roll_over_statistics();
    });
}

fn handle_client(
    stream: UnixStream,
    manager: Arc<WorkspaceManager>,
    config: SessionConfig,
    metrics: Option<Arc<Metrics>>,
    workers: usize,
    client_id: usize,
) {
    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!(client = client_id, error = %e, "failed to clone stream");
            return;
        }
    };

    let (socket, outbound) = ChannelSocket::new(&format!("client-{}", client_id));
    let socket = Arc::new(socket);
    let writer = thread::spawn(move || write_loop(writer_stream, outbound, client_id));
    let session = Arc::new(Session::new(socket.clone(), manager, config, metrics));
    let (requests, queue) = unbounded::<Request>();
    let handlers: Vec<_> = (0..workers)
        .map(|_| {
            let session = Arc::clone(&session);
            let queue = queue.clone();
            thread::spawn(move || {
                for request in queue.iter() {
                    session.handle(&request);
                }
            })
        })
        .collect();
    info!(client = client_id, workers, "client connected");

    let mut reader = stream;
    loop {
        let frame = match codec::read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!(client = client_id, "client disconnected");
                break;
            }
            Err(e) => {
                if e.is_fatal() {
                    let _ = socket.send(&Response::error(None, &e));
                }
                warn!(client = client_id, error = %e, "read failed");
                break;
            }
        };

        let request = match decode(&frame, socket.is_binary()) {
            Ok(request) => request,
            Err(e) => {
                warn!(client = client_id, error = %e, "undecodable request, closing");
                let _ = socket.send(&Response::error(None, &e));
                break;
            }
        };

        if request.method == "hello" {
            session.handle(&request);
        } else if requests.send(request).is_err() {
            break;
        }
        if socket.is_closed() {
            break;
        }
    }

    drop(requests);
    for handler in handlers {
        let _ = handler.join();
    }
    session.close();
    let _ = writer.join();
}

/// Requests arrive in the negotiated encoding, except that a binary session
/// may still send text.
fn decode(frame: &[u8], binary: bool) -> std::result::Result<Request, SyncError> {
    match codec::decode_request(frame, binary) {
        Err(_) if binary => codec::decode_request(frame, false),
        other => other,
    }
}

fn write_loop(mut stream: UnixStream, outbound: Receiver<Outbound>, client_id: usize) {
    for msg in outbound.iter() {
        match msg {
            Outbound::Frame(bytes) => {
                if let Err(e) = codec::write_frame(&mut stream, &bytes) {
                    debug!(client = client_id, error = %e, "write failed");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}
