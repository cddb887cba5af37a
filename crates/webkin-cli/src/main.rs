//! `webkin` – kinematic tree visualization server.
//!
//! Startup order mirrors the data it serves:
//!
//! 1. Load calibration overrides from `<config>/webkin/axis_overrides.json`.
//! 2. Load the initial tree: a `--k3d` bundle when given (`K3D_FILE` as
//!    fallback), else `static/example_tree.json`.
//! 3. Attach the configured transport (`--mqtt` or `--crow`); an unreachable
//!    broker is a warning, not a failure.
//! 4. Serve HTTP/WebSocket until SIGINT/SIGTERM, then disconnect the
//!    transport and exit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use webkin_bundle::K3dBundle;
use webkin_ingest::{CrowConfig, CrowIngest, Ingest, IngestHandler, MqttConfig, MqttIngest};
use webkin_kinematics::{default_store_path, CalibrationStore};
use webkin_server::{router, AppState, Coordinator};

/// Real-time kinematic tree visualization server.
#[derive(Parser, Debug)]
#[command(name = "webkin", version, about)]
struct Args {
    /// Host address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Tell clients the scene is Z-up (env: Z_UP)
    #[arg(long)]
    z_up: bool,

    /// K3D bundle file or directory to load at startup (env: K3D_FILE)
    #[arg(long, value_name = "PATH")]
    k3d: Option<PathBuf>,

    /// Use the MQTT transport
    #[arg(long, conflicts_with = "crow")]
    mqtt: bool,

    /// Use the Crow datagram transport
    #[arg(long)]
    crow: bool,

    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_broker: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// Topic for joint updates; the tree topic appends "/tree"
    #[arg(long, default_value = "robot/joints", value_name = "TOPIC")]
    mqtt_topic: String,

    /// Crowker address
    #[arg(long, default_value = "127.0.0.1:10009", value_name = "ADDR")]
    crowker: String,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn tree_topic(&self) -> String {
        format!("{}/tree", self.mqtt_topic)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);
    info!(version = env!("CARGO_PKG_VERSION"), "webkin starting");

    let static_dir = std::env::current_dir()?.join("static");
    let store_path = default_store_path();
    let store = CalibrationStore::load(store_path.clone());
    info!(path = %store_path.display(), count = store.overrides().len(), "calibration overrides loaded");

    let z_up = args.z_up || env_flag("Z_UP");
    let coordinator = Arc::new(Coordinator::new(store, z_up));

    // ── Initial tree: K3D bundle, else fallback file ──────────────────────
    let bundle = load_bundle(&args);
    match &bundle {
        Some(b) => {
            if let Err(e) = coordinator.load_tree(b.tree_doc().clone()) {
                warn!(error = %e, "bundle tree rejected");
            }
        }
        None => load_fallback_tree(&coordinator, &static_dir),
    }

    // ── Transport ─────────────────────────────────────────────────────────
    let handler: Arc<dyn IngestHandler> = coordinator.clone();
    let mut transport: Option<Box<dyn Ingest>> = if args.mqtt {
        info!("using mqtt transport");
        Some(Box::new(MqttIngest::new(
            MqttConfig {
                broker_host: args.mqtt_broker.clone(),
                broker_port: args.mqtt_port,
                joints_topic: args.mqtt_topic.clone(),
                tree_topic: args.tree_topic(),
            },
            handler,
        )))
    } else if args.crow {
        info!("using crow transport");
        Some(Box::new(CrowIngest::new(
            CrowConfig {
                crowker_addr: args.crowker.clone(),
                joints_topic: args.mqtt_topic.clone(),
                tree_topic: args.tree_topic(),
            },
            handler,
        )))
    } else {
        info!("no transport configured (use --mqtt or --crow)");
        None
    };
    if let Some(t) = &mut transport {
        if let Err(e) = t.connect().await {
            warn!(error = %e, "transport connection failed, continuing without");
        }
    }

    // ── HTTP/WebSocket surface ────────────────────────────────────────────
    let state = AppState {
        coordinator: Arc::clone(&coordinator),
        bundle: bundle.map(Arc::new),
        static_dir,
    };
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(t) = &mut transport {
        t.disconnect().await;
    }
    info!("goodbye");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolve and load the K3D bundle from `--k3d` or `K3D_FILE`.
fn load_bundle(args: &Args) -> Option<K3dBundle> {
    let path = args
        .k3d
        .clone()
        .or_else(|| std::env::var("K3D_FILE").ok().map(PathBuf::from))?;
    let path = expand_tilde(&path);
    let result = if path.is_dir() {
        K3dBundle::load_directory(&path)
    } else {
        K3dBundle::load_file(&path)
    };
    match result {
        Ok(bundle) => Some(bundle),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load k3d bundle");
            None
        }
    }
}

/// Load `static/example_tree.json` so the server has something to serve
/// before any transport delivers a tree.
fn load_fallback_tree(coordinator: &Coordinator, static_dir: &Path) {
    let path = static_dir.join("example_tree.json");
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => {
            warn!(path = %path.display(), "no fallback tree, starting with empty scene");
            return;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(doc) => match coordinator.load_tree(doc) {
            Ok(joints) => info!(?joints, "fallback tree loaded"),
            Err(e) => warn!(error = %e, "fallback tree rejected"),
        },
        Err(e) => warn!(path = %path.display(), error = %e, "fallback tree is not valid JSON"),
    }
}

/// Truthy environment flag: `1`, `true`, or `yes`.
fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Expand a leading `~/` against `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let Some(rest) = path
        .to_str()
        .and_then(|s| s.strip_prefix("~/"))
    else {
        return path.to_path_buf();
    };
    match std::env::var("HOME") {
        Ok(home) => Path::new(&home).join(rest),
        Err(_) => path.to_path_buf(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
