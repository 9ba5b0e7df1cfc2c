use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::Address;

mod bitcoind;
mod chain;
mod config;
mod connection;
mod error;
mod notification;
mod progress;
mod rescan;
mod state;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use bitcoind::BitcoindChainClient;
pub use chain::{BlockRef, ChainClient, NotificationSender, NotificationStream};
pub use config::{BitcoindConfig, SyncConfig};
pub use error::{BitcoindError, ResponseErrorKind, SyncError};
pub use notification::{ChainNotification, NotificationHandler};
pub use progress::{format_remaining, ListenerSlot, ProgressListener, ProgressSnapshot, Stage};
pub use rescan::RescanController;
pub use state::{HandlerStatus, SyncProgress, SyncState};

#[derive(Clone)]
/// Main entry point for keeping one wallet in sync with the chain
pub struct WalletSync {
    state: Arc<SyncState>,
    chain: Arc<dyn ChainClient>,
    listener: ListenerSlot,
    controller: Arc<RescanController>,
}

impl WalletSync {
    /// Sync a wallet through the given backend
    pub fn open(chain: Arc<dyn ChainClient>) -> Self {
        let state = Arc::new(SyncState::new());
        let listener = ListenerSlot::default();
        let handler = Arc::new(NotificationHandler::new(
            state.clone(),
            chain.clone(),
            listener.clone(),
        ));
        let controller = Arc::new(RescanController::new(state.clone(), chain.clone(), handler));
        Self {
            state,
            chain,
            listener,
            controller,
        }
    }

    /// Sync a wallet through the bitcoind node described by `config`
    pub async fn connect_bitcoind(config: &SyncConfig) -> Result<Self, SyncError> {
        log::info!("Opening wallet sync on {}", config.network);
        let chain = BitcoindChainClient::connect(config).await?;
        Ok(Self::open(Arc::new(chain)))
    }

    /// Replace the progress listener. Only the latest one is notified.
    pub fn set_progress_listener(&self, listener: Arc<dyn ProgressListener>) {
        self.listener.set(listener);
    }

    pub fn clear_progress_listener(&self) {
        self.listener.clear();
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }

    pub fn is_rescanning(&self) -> bool {
        self.state.is_rescanning()
    }

    pub fn progress(&self) -> SyncProgress {
        self.state.progress()
    }

    pub async fn rescan_all(&self) -> Result<(), SyncError> {
        self.controller.rescan_all().await
    }

    pub async fn rescan_from_height(&self, height: u32) -> Result<(), SyncError> {
        self.controller.rescan_from_height(height).await
    }

    /// Rescan from `start` while watching `addrs` on top of the wallet's filter.
    pub async fn rescan(&self, start: BlockRef, addrs: HashSet<Address>) -> Result<(), SyncError> {
        self.controller.rescan(Some(start), Some(addrs)).await
    }

    pub fn cancel_rescan(&self) {
        self.controller.cancel_rescan();
    }

    /// Follow the chain without rescanning. Returns false if already following.
    pub fn start_sync(&self) -> bool {
        self.controller.start_sync()
    }

    /// Stop following the chain. A running rescan is cancelled.
    pub fn close(&self) {
        if self.state.is_rescanning() {
            self.controller.cancel_rescan();
        } else {
            self.chain.disconnect();
        }
        log::info!("Wallet sync closed");
    }
}
