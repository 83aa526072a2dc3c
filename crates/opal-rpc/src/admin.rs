//! Admin RPC operations
//!
//! Service control, lock inspection, format re-initialization and the
//! two-phase configuration update (write to a temp name, then commit by
//! rename) that keeps all peers on one config version.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use opal_common::config::ServerConfig;
use opal_common::error::{Error, Result};
use opal_common::types::{ServiceSignal, StorageInfo};
use opal_lock::VolumeLockInfo;
use opal_object::{ObjectLayer, ServerContext};

use crate::AuthArgs;

/// SignalService arguments
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalServiceArgs {
    pub auth: AuthArgs,
    pub signal: ServiceSignal,
}

/// ReInitFormat arguments
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReInitFormatArgs {
    pub auth: AuthArgs,
    pub dry_run: bool,
}

/// ListLocks query
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListLocksQuery {
    pub auth: AuthArgs,
    pub bucket: String,
    pub prefix: String,
    /// Only locks held longer than this are reported.
    pub duration_ms: u64,
}

/// ServerInfo reply
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerInfoReply {
    pub storage_info: StorageInfo,
    pub region: String,
    pub uptime_secs: u64,
}

/// WriteTmpConfig arguments
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteConfigArgs {
    pub auth: AuthArgs,
    pub tmp_file_name: String,
    pub buf: Vec<u8>,
}

/// CommitConfig arguments
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitConfigArgs {
    pub auth: AuthArgs,
    pub file_name: String,
}

/// The admin service every node answers
#[async_trait]
pub trait AdminService: Send + Sync {
    /// Deliver a restart/stop signal to the server loop.
    async fn signal_service(&self, args: SignalServiceArgs) -> Result<()>;

    /// Validate (dry run) or perform a format re-initialization.
    async fn re_init_format(&self, args: ReInitFormatArgs) -> Result<()>;

    async fn list_locks(&self, query: ListLocksQuery) -> Result<Vec<VolumeLockInfo>>;

    async fn server_info(&self, auth: AuthArgs) -> Result<ServerInfoReply>;

    /// Serialized active configuration.
    async fn get_config(&self, auth: AuthArgs) -> Result<Vec<u8>>;

    /// Stage a new configuration under a temporary name.
    async fn write_tmp_config(&self, args: WriteConfigArgs) -> Result<()>;

    /// Atomically promote a staged configuration and publish it.
    async fn commit_config(&self, args: CommitConfigArgs) -> Result<()>;
}

/// In-process admin receiver bound to this node's object layer
pub struct LocalAdminReceiver {
    layer: Arc<dyn ObjectLayer>,
    ctx: Arc<ServerContext>,
    config_dir: PathBuf,
    token: String,
    started: Instant,
}

impl LocalAdminReceiver {
    #[must_use]
    pub fn new(
        layer: Arc<dyn ObjectLayer>,
        ctx: Arc<ServerContext>,
        config_dir: PathBuf,
        token: impl Into<String>,
    ) -> Self {
        Self {
            layer,
            ctx,
            config_dir,
            token: token.into(),
            started: Instant::now(),
        }
    }

    fn staged_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::invalid_argument(format!(
                "invalid config file name {name:?}"
            )));
        }
        Ok(self.config_dir.join(name))
    }
}

#[async_trait]
impl AdminService for LocalAdminReceiver {
    async fn signal_service(&self, args: SignalServiceArgs) -> Result<()> {
        args.auth.validate(&self.token)?;
        info!(signal = ?args.signal, "service signal received");
        self.ctx.send_signal(args.signal);
        Ok(())
    }

    async fn re_init_format(&self, args: ReInitFormatArgs) -> Result<()> {
        args.auth.validate(&self.token)?;
        if args.dry_run {
            // Dry run only proves the node is up and would accept the
            // operation.
            return Ok(());
        }
        Err(Error::not_implemented(
            "online format re-initialization; restart the node instead",
        ))
    }

    async fn list_locks(&self, query: ListLocksQuery) -> Result<Vec<VolumeLockInfo>> {
        query.auth.validate(&self.token)?;
        self.layer
            .list_locks(
                &query.bucket,
                &query.prefix,
                Duration::from_millis(query.duration_ms),
            )
            .await
    }

    async fn server_info(&self, auth: AuthArgs) -> Result<ServerInfoReply> {
        auth.validate(&self.token)?;
        Ok(ServerInfoReply {
            storage_info: self.layer.storage_info().await,
            region: self.ctx.config().load().region.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }

    async fn get_config(&self, auth: AuthArgs) -> Result<Vec<u8>> {
        auth.validate(&self.token)?;
        self.ctx.config().load().to_json()
    }

    async fn write_tmp_config(&self, args: WriteConfigArgs) -> Result<()> {
        args.auth.validate(&self.token)?;
        // Reject garbage before it is staged anywhere.
        ServerConfig::from_json(&args.buf)?;
        let path = self.staged_path(&args.tmp_file_name)?;
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| Error::Configuration(format!("config dir: {e}")))?;
        tokio::fs::write(&path, &args.buf)
            .await
            .map_err(|e| Error::Configuration(format!("stage config: {e}")))
    }

    async fn commit_config(&self, args: CommitConfigArgs) -> Result<()> {
        args.auth.validate(&self.token)?;
        let staged = self.staged_path(&args.file_name)?;
        let raw = tokio::fs::read(&staged)
            .await
            .map_err(|e| Error::Configuration(format!("read staged config: {e}")))?;
        let config = ServerConfig::from_json(&raw)?;

        let live = self.config_dir.join("config.json");
        tokio::fs::rename(&staged, &live)
            .await
            .map_err(|e| Error::Configuration(format!("commit config: {e}")))?;
        self.ctx.config().store(config);
        info!("configuration committed and published");
        Ok(())
    }
}
