//! Opal server
//!
//! Wires disks, locking, the storage backend and the background workers
//! together from a list of endpoints, then runs until told to stop. One
//! local directory starts the filesystem backend; several local
//! directories start the single-node erasure backend. The S3 HTTP edge
//! and the RPC transports mount on top of the object layer and the
//! local receivers built here.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opal_common::config::ServerConfig;
use opal_common::endpoint::{EndpointList, SetupType};
use opal_common::types::ServiceSignal;
use opal_lock::NsLockMap;
use opal_object::{FsObjects, MultipartCoordinator, ObjectLayer, ServerContext, XlObjects};
use opal_rpc::{LocalAdminReceiver, LocalPeerReceiver};

/// Exit code asking the supervisor to restart the process.
const RESTART_EXIT_CODE: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "opal-server")]
#[command(about = "Opal S3-compatible object storage server")]
#[command(version)]
struct Args {
    /// Disk endpoints: local directories, or http://host:port/path for
    /// peers. One directory runs the FS backend, several run erasure.
    #[arg(required = true)]
    endpoints: Vec<String>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/opal/config.toml")]
    config: String,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shared secret for admin and peer RPC; generated when absent.
    #[arg(long, env = "OPAL_ADMIN_TOKEN")]
    admin_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::load(&args.config).context("loading configuration")?;
    let endpoints = EndpointList::parse(&args.endpoints).context("parsing endpoints")?;
    let setup = endpoints.setup_type();
    info!(?setup, drives = endpoints.len(), "starting opal server");

    let ctx = ServerContext::new(config.clone(), NsLockMap::new_local());

    let (layer, multipart): (Arc<dyn ObjectLayer>, Arc<MultipartCoordinator>) = match setup {
        SetupType::Fs => {
            let fs = FsObjects::new(&endpoints[0].path, ctx.clone())
                .await
                .context("initializing fs backend")?;
            let mp = fs.multipart().clone();
            (Arc::new(fs), mp)
        }
        SetupType::Erasure => {
            let roots: Vec<PathBuf> = endpoints.iter().map(|e| e.path.clone()).collect();
            let xl = XlObjects::open(&roots, ctx.clone())
                .await
                .context("initializing erasure backend")?;
            let mp = xl.multipart().clone();
            (Arc::new(xl), mp)
        }
        SetupType::DistErasure => {
            // The distributed lock and storage clients are trait-shaped;
            // a deployment supplies the transport that implements them.
            bail!(
                "endpoints span multiple hosts but no peer transport is \
                 configured; run one host per process or front the \
                 cluster with the deployment's RPC transport"
            );
        }
    };

    // Stale multipart uploads are reaped for the life of the process.
    let cleaner = tokio::spawn(multipart.clone().run_cleaner(
        config.multipart.cleanup_interval(),
        config.multipart.expiry(),
        ctx.shutdown_signal(),
    ));

    let admin_token = args.admin_token.unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        warn!("no admin token configured; generated one for this run");
        token
    });
    let config_dir = PathBuf::from(&args.config)
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let _admin =
        LocalAdminReceiver::new(layer.clone(), ctx.clone(), config_dir, admin_token.as_str());
    let _peer = LocalPeerReceiver::new(layer.clone(), admin_token.as_str());

    let info = layer.storage_info().await;
    info!(
        online = info.backend.online_disks,
        offline = info.backend.offline_disks,
        "object layer ready"
    );

    let mut signals = ctx
        .take_signal_receiver()
        .expect("signal receiver taken once");
    let restart = loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("signal handler failed: {e}");
                }
                info!("interrupt received, shutting down");
                break false;
            }
            signal = signals.recv() => {
                match signal {
                    Some(ServiceSignal::Stop) => {
                        info!("stop requested over admin rpc");
                        break false;
                    }
                    Some(ServiceSignal::Restart) => {
                        info!("restart requested over admin rpc");
                        break true;
                    }
                    None => break false,
                }
            }
        }
    };

    ctx.trigger_shutdown();
    if let Err(e) = layer.shutdown().await {
        warn!("backend shutdown reported: {e}");
    }
    if let Err(e) = cleaner.await {
        warn!("cleaner task join failed: {e}");
    }
    info!("opal server stopped");

    if restart {
        std::process::exit(RESTART_EXIT_CODE);
    }
    Ok(())
}
