//! Loom Daemon - Background substrate service
//!
//! This daemon keeps one substrate learning in the background:
//! - a single writer task owns the substrate and runs its tick loop
//! - activations from clients go straight into the substrate's feed
//! - state reads are served from the last published snapshot
//! - the topology image is persisted under the OS data dir
//!
//! Storage locations:
//! - Linux: ~/.local/share/loom/
//! - Windows: %APPDATA%\loom\
//! - MacOS: ~/Library/Application Support/loom/

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write as _};
use std::path::Path;
use std::result::Result;
use std::time::Duration;

use loom::feed::ActivationFeed;
use loom::observer::{SubstrateAdapter, SubstrateSnapshot, TopologyAdapter, TopologyExport};
use loom::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod paths;

use paths::AppPaths;

const LISTEN_ADDR: &str = "127.0.0.1:9877";
const COMMAND_QUEUE: usize = 256;
/// Upper bound on client-requested propagation steps.
const MAX_PROPAGATE_STEPS: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("could not determine data directory")]
    NoDataDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Loom(#[from] LoomError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("writer task is gone")]
    WriterGone,
}

// ═══════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
struct DaemonConfig {
    substrate: SubstrateConfig,
    /// Milliseconds between substrate ticks.
    tick_millis: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            substrate: SubstrateConfig::default(),
            tick_millis: 50,
        }
    }
}

impl DaemonConfig {
    /// Read `config.json` if present; defaults otherwise.
    fn load(path: &Path) -> Result<Self, DaemonError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Messages
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    /// Read-only snapshot of the substrate.
    GetState,
    RecordActivation {
        node: NodeId,
        strength: f32,
    },
    Modulate {
        hormone: String,
        level: f32,
    },
    Weave {
        #[serde(default)]
        embedding: Option<Vec<f32>>,
    },
    Connect {
        src: NodeId,
        dst: NodeId,
        strength: f32,
        #[serde(default)]
        bidirectional: bool,
    },
    CreateHyperedge {
        members: Vec<NodeId>,
        name: String,
    },
    Propagate {
        sources: Vec<NodeId>,
        steps: usize,
    },
    Export,
    Save,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(clippy::large_enum_variant)]
enum Response {
    State { snapshot: SubstrateSnapshot },
    Accepted { queued: bool },
    Node { id: NodeId },
    Propagation { report: PropagationReport },
    Export { export: TopologyExport },
    Success { message: String },
    Error { message: String },
}

impl From<LoomError> for Response {
    fn from(e: LoomError) -> Self {
        Response::Error {
            message: e.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Writer
// ═══════════════════════════════════════════════════════════════════════════

struct Command {
    request: Request,
    reply: oneshot::Sender<Response>,
}

fn snapshot(substrate: &Substrate) -> SubstrateSnapshot {
    SubstrateAdapter::new(substrate).snapshot()
}

fn save_image(substrate: &Substrate, path: &Path) -> Result<(), DaemonError> {
    let tmp = path.with_extension("lti.tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        substrate.save_image_to(&mut w)?;
        w.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn load_or_new(cfg: &DaemonConfig, paths: &AppPaths) -> Result<Substrate, DaemonError> {
    let image = paths.image_file();
    if image.exists() {
        let mut r = BufReader::new(File::open(&image)?);
        match Substrate::load_image_from(cfg.substrate, &mut r) {
            Ok(s) => {
                info!(nodes = s.topology().node_count(), "loaded topology image");
                return Ok(s);
            }
            Err(e) => warn!("could not load {}: {e}", image.display()),
        }
    }
    info!("starting with a fresh substrate");
    Ok(Substrate::new(cfg.substrate)?)
}

/// Execute one request against the substrate. Only the writer calls this.
fn apply(substrate: &mut Substrate, request: Request, image: &Path) -> Response {
    match request {
        Request::GetState => Response::State {
            snapshot: snapshot(substrate),
        },
        Request::RecordActivation { node, strength } => {
            substrate.record_activation(node, strength);
            Response::Accepted { queued: true }
        }
        Request::Modulate { hormone, level } => {
            match substrate.topology_mut().modulate_named(&hormone, level) {
                Ok(()) => Response::Success {
                    message: format!("{hormone} set"),
                },
                Err(e) => e.into(),
            }
        }
        Request::Weave { embedding } => {
            match substrate.topology_mut().weave(embedding.as_deref()) {
                Ok(id) => Response::Node { id },
                Err(e) => e.into(),
            }
        }
        Request::Connect {
            src,
            dst,
            strength,
            bidirectional,
        } => match substrate
            .topology_mut()
            .connect(src, dst, strength, bidirectional)
        {
            Ok(()) => Response::Success {
                message: format!("{src} -> {dst}"),
            },
            Err(e) => e.into(),
        },
        Request::CreateHyperedge { members, name } => {
            match substrate.topology_mut().create_hyperedge(&members, &name) {
                Ok(id) => Response::Node { id },
                Err(e) => e.into(),
            }
        }
        Request::Propagate { sources, steps } => Response::Propagation {
            report: substrate
                .topology_mut()
                .propagate(&sources, steps.min(MAX_PROPAGATE_STEPS)),
        },
        Request::Export => Response::Export {
            export: TopologyAdapter::new(substrate.topology()).export(),
        },
        Request::Save | Request::Shutdown => match save_image(substrate, image) {
            Ok(()) => Response::Success {
                message: format!("saved {}", image.display()),
            },
            Err(e) => Response::Error {
                message: format!("save failed: {e}"),
            },
        },
    }
}

async fn run_writer(
    mut substrate: Substrate,
    mut commands: mpsc::Receiver<Command>,
    state: watch::Sender<SubstrateSnapshot>,
    image: std::path::PathBuf,
    tick_every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval(tick_every);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(Command { request, reply }) = cmd else {
                    break;
                };
                let stop = matches!(request, Request::Shutdown);
                let _ = reply.send(apply(&mut substrate, request, &image));
                state.send_replace(snapshot(&substrate));
                if stop {
                    info!("shutdown requested");
                    break;
                }
            }
            _ = ticker.tick() => {
                substrate.tick();
                state.send_replace(snapshot(&substrate));
            }
        }
    }
    shutdown.cancel();
}

// ═══════════════════════════════════════════════════════════════════════════
// Clients
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct ClientContext {
    commands: mpsc::Sender<Command>,
    feed: ActivationFeed,
    state: watch::Receiver<SubstrateSnapshot>,
}

impl ClientContext {
    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::GetState => Response::State {
                snapshot: self.state.borrow().clone(),
            },
            Request::RecordActivation { node, strength } => Response::Accepted {
                queued: self.feed.record(node, strength),
            },
            request => match self.roundtrip(request).await {
                Ok(resp) => resp,
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
        }
    }

    async fn roundtrip(&self, request: Request) -> Result<Response, DaemonError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { request, reply })
            .await
            .map_err(|_| DaemonError::WriterGone)?;
        rx.await.map_err(|_| DaemonError::WriterGone)
    }
}

async fn handle_client(stream: TcpStream, ctx: ClientContext) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = AsyncBufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => ctx.dispatch(request).await,
            Err(e) => Response::Error {
                message: format!("Invalid request: {e}"),
            },
        };
        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    tracing_subscriber::fmt::init();

    let paths = AppPaths::new()?;
    let cfg = DaemonConfig::load(&paths.config_file())?;
    info!("Persistence initialized ({})", paths.data_dir().display());

    let substrate = load_or_new(&cfg, &paths)?;
    let (state_tx, state_rx) = watch::channel(snapshot(&substrate));
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let shutdown = CancellationToken::new();

    let ctx = ClientContext {
        commands: cmd_tx,
        feed: substrate.feed(),
        state: state_rx,
    };

    tokio::spawn(run_writer(
        substrate,
        cmd_rx,
        state_tx,
        paths.image_file(),
        Duration::from_millis(cfg.tick_millis.max(1)),
        shutdown.clone(),
    ));

    // Save on Ctrl-C so state persists even if the daemon is stopped abruptly.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                match ctx.roundtrip(Request::Shutdown).await {
                    Ok(Response::Success { message }) => info!("Ctrl-C: {message}"),
                    Ok(other) => error!("Ctrl-C save failed: {other:?}"),
                    Err(e) => error!("Ctrl-C save failed: {e}"),
                }
            }
        });
    }

    let listener = TcpListener::bind(LISTEN_ADDR).await?;
    info!("Loom daemon listening on {LISTEN_ADDR}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                info!("Client connected: {}", addr);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, ctx).await {
                        error!("Client handler error: {}", e);
                    }
                });
            }
            _ = shutdown.cancelled() => break,
        }
    }

    info!("Loom daemon stopped");
    Ok(())
}
