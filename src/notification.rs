use std::sync::Arc;
use std::time::Instant;

use bitcoin::Transaction;

use crate::chain::{BlockRef, ChainClient};
use crate::progress::{ListenerSlot, ProgressSnapshot};
use crate::state::{HandlerStatus, SyncState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainNotification {
    BlockConnected(BlockRef),
    BlockDisconnected(BlockRef),
    RelevantTransaction {
        tx: Transaction,
        block: Option<BlockRef>,
    },
    HeadersFetched {
        height: u32,
        target: u32,
    },
    AddressDiscovery {
        percent: u8,
    },
    RescanProgress {
        height: u32,
        target: u32,
    },
    RescanFinished {
        height: u32,
    },
    /// The backend caught up with the chain tip.
    Synced {
        tip: BlockRef,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    /// Closed on purpose through [`ChainClient::disconnect`]
    Closed,
    Lost,
}

/// Drains a wallet's notification stream into its [`SyncState`].
///
/// At most one drain task runs per wallet: starting one goes through
/// [`SyncState::compare_and_set_started`].
pub struct NotificationHandler {
    state: Arc<SyncState>,
    chain: Arc<dyn ChainClient>,
    listener: ListenerSlot,
}

impl NotificationHandler {
    pub fn new(state: Arc<SyncState>, chain: Arc<dyn ChainClient>, listener: ListenerSlot) -> Self {
        Self {
            state,
            chain,
            listener,
        }
    }

    /// Spawn the drain task unless one is already running. Returns whether this call
    /// started it.
    pub fn ensure_running(self: &Arc<Self>) -> bool {
        if !self
            .state
            .compare_and_set_started(HandlerStatus::Stopped, HandlerStatus::Started)
        {
            log::debug!("Notification handler already running");
            return false;
        }

        let handler = self.clone();
        tokio::spawn(async move { handler.run().await });
        true
    }

    async fn run(self: Arc<Self>) {
        log::info!("Notification handler started");
        loop {
            let epoch = self.state.rescan_epoch();
            let lost = self.drain().await == StreamEnd::Lost;

            if !self.state.release_handler(epoch, lost) {
                break;
            }
            // A rescan began while this run was winding down and could not claim the flag.
            if !self
                .state
                .compare_and_set_started(HandlerStatus::Stopped, HandlerStatus::Started)
            {
                break;
            }
            log::info!("Restarting notification handler for a pending rescan");
        }
        log::info!("Notification handler stopped");
    }

    async fn drain(&self) -> StreamEnd {
        let (generation, mut stream) = loop {
            let generation = self.state.stream_generation();
            let stream = match self.chain.notification_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Failed to open notification stream: {}", e);
                    return StreamEnd::Lost;
                }
            };
            // A cancel while opening may or may not have closed this stream.
            if self.state.stream_generation() == generation {
                break (generation, stream);
            }
            log::debug!("Rescan cancelled while opening the notification stream, reopening");
        };

        loop {
            match stream.next().await {
                Some(Ok(notification)) => self.handle_notification(generation, notification),
                Some(Err(e)) if e.is_stream_fatal() => {
                    log::warn!("Notification stream terminated: {}", e);
                    return StreamEnd::Lost;
                }
                Some(Err(e)) => log::error!("Failed to process notification: {}", e),
                None => {
                    log::info!("Notification stream closed");
                    return StreamEnd::Closed;
                }
            }
        }
    }

    /// Rescan events are dropped unless `generation` is still current.
    pub(crate) fn handle_notification(&self, generation: u64, notification: ChainNotification) {
        let listener = self.listener.get();
        match notification {
            ChainNotification::BlockConnected(block) => {
                log::debug!("Block connected at height {}: {}", block.height, block.hash);
                self.state.block_connected(block);
            }
            ChainNotification::BlockDisconnected(block) => {
                log::warn!("Block disconnected at height {}: {}", block.height, block.hash);
                self.state.block_disconnected(&block);
            }
            ChainNotification::RelevantTransaction { tx, block } => {
                match block {
                    Some(b) => log::info!(
                        "Found relevant transaction {} in block {}",
                        tx.compute_txid(),
                        b.height
                    ),
                    None => log::info!("Found relevant unconfirmed transaction {}", tx.compute_txid()),
                }
                self.state.record_relevant_tx();
            }
            ChainNotification::HeadersFetched { height, target } => {
                self.state.update_headers(height, target);
                if let Some(listener) = listener {
                    let snapshot = ProgressSnapshot::headers(&self.state.progress(), Instant::now());
                    listener.on_headers_fetch_progress(&snapshot);
                }
            }
            ChainNotification::AddressDiscovery { percent } => {
                self.state.update_discovery(percent);
                if let Some(listener) = listener {
                    let snapshot =
                        ProgressSnapshot::discovery(&self.state.progress(), Instant::now());
                    listener.on_address_discovery_progress(&snapshot);
                }
            }
            ChainNotification::RescanProgress { height, target } => {
                if !self.state.update_rescan(generation, height, target) {
                    log::debug!("Ignoring progress of an inactive rescan at height {}", height);
                    return;
                }
                if let Some(listener) = listener {
                    let snapshot = ProgressSnapshot::rescan(&self.state.progress(), Instant::now());
                    listener.on_rescan_progress(&snapshot);
                }
            }
            // The handler keeps draining afterwards to follow new blocks. It only stops
            // when the stream ends.
            ChainNotification::RescanFinished { height } => {
                if !self.state.finish_rescan(generation, height) {
                    log::debug!("Ignoring end of an inactive rescan at height {}", height);
                    return;
                }
                log::info!("Rescan finished at height {}", height);
                if let Some(listener) = listener {
                    let snapshot = ProgressSnapshot::rescan(&self.state.progress(), Instant::now());
                    listener.on_rescan_progress(&snapshot);
                    listener.on_sync_completed();
                }
            }
            ChainNotification::Synced { tip } => {
                log::info!("Wallet synced to height {}", tip.height);
                self.state.set_synced(true);
                self.state.block_connected(tip);
                if let Some(listener) = listener {
                    listener.on_sync_completed();
                }
            }
        }
    }
}

