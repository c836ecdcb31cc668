mod background;
mod broadcast;
mod handlers;
mod session;
mod state;
mod supervisor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, header};
use axum::routing::{get, post};
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use cbsrt_core::config::{RigOptions, RigPaths};
use cbsrt_core::setup::ProcessRunner;

use broadcast::Broadcaster;
use session::Session;
use state::SharedSession;

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(
    name = "cbsrt-web",
    about = "Live CBS shaping measurement monitor",
    version = cbsrt_core::VERSION
)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8010", env = "CBSRT_LISTEN")]
    listen: String,

    /// Directory with the dashboard's static files.
    #[arg(long, default_value = "static", env = "CBSRT_STATIC_DIR")]
    static_dir: PathBuf,

    /// Receiver counter CSV.
    #[arg(long, default_value = "/tmp/cbs_rx.csv", env = "CBSRT_RX_CSV")]
    rx_csv: PathBuf,

    /// Directory for per-class transmitter stats files.
    #[arg(long, default_value = "/tmp", env = "CBSRT_TX_STATS_DIR")]
    tx_stats_dir: PathBuf,

    /// Directory for rendered board patches.
    #[arg(long, default_value = "/tmp", env = "CBSRT_PATCH_DIR")]
    patch_dir: PathBuf,

    /// Receiver binary.
    #[arg(long, default_value = "rxcap", env = "CBSRT_RXCAP")]
    rxcap: PathBuf,

    /// Transmitter binary, started once per traffic class.
    #[arg(long, default_value = "txgen", env = "CBSRT_TXGEN")]
    txgen: PathBuf,

    /// Board configuration CLI.
    #[arg(long, default_value = "keti-tsn", env = "CBSRT_BOARD_CLI")]
    board_cli: PathBuf,

    /// Serial device of the bridge board.
    #[arg(long, default_value = "/dev/ttyACM0", env = "CBSRT_DEVICE")]
    device: PathBuf,

    /// Run without a packet capture process.
    #[arg(long, env = "CBSRT_NO_CAPTURE")]
    no_capture: bool,

    /// Do not prefix privileged commands with sudo.
    #[arg(long, env = "CBSRT_NO_SUDO")]
    no_sudo: bool,

    /// Skip CPU governor and USB autosuspend tuning.
    #[arg(long, env = "CBSRT_NO_TUNE")]
    no_tune: bool,

    /// Do not pin measurement processes to CPUs.
    #[arg(long, env = "CBSRT_NO_PIN")]
    no_pin: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn rig_paths(&self) -> RigPaths {
        RigPaths {
            rx_csv: self.rx_csv.clone(),
            tx_stats_dir: self.tx_stats_dir.clone(),
            patch_dir: self.patch_dir.clone(),
            rxcap_bin: self.rxcap.clone(),
            txgen_bin: self.txgen.clone(),
            board_cli: self.board_cli.clone(),
            device: self.device.clone(),
        }
    }

    fn rig_options(&self) -> RigOptions {
        RigOptions {
            use_sudo: !self.no_sudo,
            pin_cpus: !self.no_pin,
            capture: !self.no_capture,
            tune_system: !self.no_tune,
        }
    }
}

/// Default level is INFO. Use -q for errors only.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["cbsrt_web", "cbsrt_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    runtime.block_on(async_main(args));
}

fn router(session: SharedSession, static_dir: PathBuf) -> Router {
    Router::new()
        .route("/events", get(handlers::handle_events))
        .route("/start", post(handlers::handle_start))
        .route("/stop", post(handlers::handle_stop))
        .route("/apply", post(handlers::handle_apply))
        .route("/status", get(handlers::handle_status))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(session)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}

async fn async_main(args: Args) {
    let paths = args.rig_paths();
    let opts = args.rig_options();
    info!(
        version = cbsrt_core::VERSION,
        rx_csv = %paths.rx_csv.display(),
        device = %paths.device.display(),
        sudo = opts.use_sudo,
        capture = opts.capture,
        "starting"
    );

    let session: SharedSession = Arc::new(Session::new(
        paths,
        opts,
        Arc::new(ProcessRunner),
        Broadcaster::spawn(),
    ));

    let app = router(session.clone(), args.static_dir.clone());

    let addr: SocketAddr = match args.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "invalid listen address");
            process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, static_dir = %args.static_dir.display(), "listening");

    // Open SSE streams never end on their own, so shutdown does not drain them.
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                session.stop();
                process::exit(1);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
            session.stop();
        }
    }
}
