//! CSI Node Driver
//!
//! Kubernetes CSI driver for iSCSI-attached networked block-storage
//! arrays. Serves the CSI Identity and Node services on the kubelet's
//! CSI endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use csi_driver::csi::identity_server::IdentityServer;
use csi_driver::csi::node_server::NodeServer;
use csi_driver::{ArrayClient, IdentityService, NodeService, metrics};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "csi-driver")]
#[command(about = "CSI node driver for iSCSI-attached block-storage arrays")]
struct Args {
    /// CSI endpoint (unix socket path or TCP address)
    #[arg(long, default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Prometheus metrics listen address (disabled when unset)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Determine node_id
    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = %csi_driver::DRIVER_NAME,
        driver_version = %csi_driver::DRIVER_VERSION,
        endpoint = %args.endpoint,
        node_id = %node_id,
        "Starting CSI node driver"
    );

    if let Some(addr) = args.metrics_addr {
        metrics::init_metrics(addr)?;
    }

    // One REST transport shared by every request; credentials are applied
    // per call from each request's secrets.
    let array = Arc::new(ArrayClient::new());

    let identity = IdentityService::new();
    let node = NodeService::new(node_id, array);

    let router = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node));

    if let Some(path) = args.endpoint.strip_prefix("unix://") {
        // Remove a stale socket from a previous run
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        info!(socket = %path, "gRPC server listening on unix socket");
        router.serve_with_incoming(UnixListenerStream::new(listener)).await?;
    } else {
        let addr = args.endpoint.parse()?;
        info!(addr = %addr, "gRPC server listening");
        router.serve(addr).await?;
    }

    Ok(())
}
