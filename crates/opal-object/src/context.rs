//! Server context
//!
//! One value owning the cross-cutting state that used to be process
//! globals: the active configuration, the namespace lock map, the
//! shutdown signal for background workers and the admin service-signal
//! channel. Handlers receive it at construction; tests build a fresh
//! context per case.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use opal_common::config::{ConfigHandle, ServerConfig};
use opal_common::types::ServiceSignal;
use opal_lock::NsLockMap;

/// Shared server state threaded through handler construction
pub struct ServerContext {
    config: ConfigHandle,
    ns: Arc<NsLockMap>,
    shutdown_tx: watch::Sender<bool>,
    signal_tx: mpsc::UnboundedSender<ServiceSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<ServiceSignal>>>,
}

impl ServerContext {
    #[must_use]
    pub fn new(config: ServerConfig, ns: Arc<NsLockMap>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config: ConfigHandle::new(config),
            ns,
            shutdown_tx,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        })
    }

    /// Fresh context with default config and local locking; the shape
    /// every unit test wants.
    #[must_use]
    pub fn for_tests() -> Arc<Self> {
        Self::new(ServerConfig::default(), NsLockMap::new_local())
    }

    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    #[must_use]
    pub fn ns(&self) -> &Arc<NsLockMap> {
        &self.ns
    }

    /// Subscribe to the shutdown signal; fires once on shutdown.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Tell every background worker to exit.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Deliver an admin service signal (restart/stop) to the server loop.
    pub fn send_signal(&self, signal: ServiceSignal) {
        let _ = self.signal_tx.send(signal);
    }

    /// Take the service-signal receiver; the server main loop calls this
    /// exactly once.
    #[must_use]
    pub fn take_signal_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServiceSignal>> {
        self.signal_rx.lock().take()
    }
}
