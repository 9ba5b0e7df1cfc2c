use std::collections::HashSet;

use async_trait::async_trait;
use bitcoin::{Address, Block, BlockHash};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::notification::ChainNotification;

/// A block identified by both its height and its hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: u32,
    pub hash: BlockHash,
}

impl BlockRef {
    pub fn new(height: u32, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

pub type NotificationSender = mpsc::UnboundedSender<Result<ChainNotification, SyncError>>;

/// Notifications from one backend connection.
///
/// `None` from [`NotificationStream::next`] means the connection was closed on purpose.
/// An involuntary loss shows up as a [`SyncError::ConnectionLost`] item before the end.
pub struct NotificationStream {
    receiver: mpsc::UnboundedReceiver<Result<ChainNotification, SyncError>>,
}

impl NotificationStream {
    pub fn channel() -> (NotificationSender, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, Self { receiver })
    }

    pub async fn next(&mut self) -> Option<Result<ChainNotification, SyncError>> {
        self.receiver.recv().await
    }
}

/// Connection to the node or peer service of one chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Hash of the best-chain block at `height`, [`SyncError::NotFound`] past the tip.
    async fn resolve_block_hash(&self, height: u32) -> Result<BlockHash, SyncError>;

    async fn fetch_block(&self, hash: &BlockHash) -> Result<Block, SyncError>;

    /// Subscribe to transactions touching `addrs`. An empty set keeps the filter that
    /// was previously registered for the wallet.
    async fn register_address_filter(&self, addrs: &HashSet<Address>) -> Result<(), SyncError>;

    /// Walk the chain from `from` to the tip against the registered filter, reporting
    /// on the notification stream and ending with [`ChainNotification::RescanFinished`].
    async fn start_rescan(&self, from: &BlockRef) -> Result<(), SyncError>;

    /// Open the notification stream. Opening a new one closes any previous stream.
    async fn notification_stream(&self) -> Result<NotificationStream, SyncError>;

    /// Stop the underlying connection. Does not wait for in-flight requests.
    fn disconnect(&self);
}
