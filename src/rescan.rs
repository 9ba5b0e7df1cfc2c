use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::Address;

use crate::chain::{BlockRef, ChainClient};
use crate::error::SyncError;
use crate::notification::NotificationHandler;
use crate::state::SyncState;

/// Starts and cancels rescans of one wallet.
pub struct RescanController {
    state: Arc<SyncState>,
    chain: Arc<dyn ChainClient>,
    handler: Arc<NotificationHandler>,
}

impl RescanController {
    pub fn new(
        state: Arc<SyncState>,
        chain: Arc<dyn ChainClient>,
        handler: Arc<NotificationHandler>,
    ) -> Self {
        Self {
            state,
            chain,
            handler,
        }
    }

    pub async fn rescan_all(&self) -> Result<(), SyncError> {
        self.rescan_from_height(0).await
    }

    pub async fn rescan_from_height(&self, height: u32) -> Result<(), SyncError> {
        // Don't bother the backend when the rescan would be refused anyway.
        self.state.check_can_rescan()?;

        let hash = self.chain.resolve_block_hash(height).await?;
        let block = self.chain.fetch_block(&hash).await?;
        let start = BlockRef::new(height, block.block_hash());
        log::info!("Rescanning from block {} at height {}", start.hash, height);

        self.rescan(Some(start), None).await
    }

    /// Rescan from `start`, watching `addrs` or, if `None`, the wallet's existing filter.
    ///
    /// Returns once the backend accepted the request; the rescan itself runs in the
    /// background and is observed through [`SyncState::is_rescanning`] and the progress
    /// listener.
    pub async fn rescan(
        &self,
        start: Option<BlockRef>,
        addrs: Option<HashSet<Address>>,
    ) -> Result<(), SyncError> {
        self.state.check_can_rescan()?;
        let start = start.ok_or_else(|| {
            SyncError::Validation(
                "block hash from where to start rescanning must be provided".to_string(),
            )
        })?;
        let addrs = addrs.unwrap_or_default();

        let epoch = self.state.begin_rescan_from(start.height)?;

        if let Err(e) = self.request_rescan(&start, &addrs).await {
            log::error!("Rescan request from height {} failed: {}", start.height, e);
            // Cancelled and replaced while waiting on the backend: the newer rescan stays.
            if !self.state.end_rescan(epoch) {
                log::debug!("Rescan from height {} was already superseded", start.height);
            }
            return Err(e);
        }

        self.handler.ensure_running();
        Ok(())
    }

    async fn request_rescan(&self, start: &BlockRef, addrs: &HashSet<Address>) -> Result<(), SyncError> {
        self.chain.register_address_filter(addrs).await?;
        self.chain.start_rescan(start).await
    }

    /// Hard cancel. Progress is not checkpointed.
    pub fn cancel_rescan(&self) {
        self.state.cancel_rescan();
        self.chain.disconnect();
        log::info!("Rescan cancelled");
    }

    /// Start draining notifications without a rescan, so the backend can report the
    /// wallet as synced.
    pub fn start_sync(&self) -> bool {
        self.handler.ensure_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::ChainNotification;
    use crate::progress::ListenerSlot;
    use crate::state::HandlerStatus;
    use crate::testutils::{wait_until, MockChainClient, RecordingListener};

    struct Fixture {
        state: Arc<SyncState>,
        chain: Arc<MockChainClient>,
        listener: Arc<RecordingListener>,
        controller: RescanController,
    }

    fn fixture(tip: u32, synced: bool) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let state = Arc::new(SyncState::new());
        state.set_synced(synced);
        let chain = Arc::new(MockChainClient::new(tip));
        let listener = Arc::new(RecordingListener::default());
        let slot = ListenerSlot::default();
        slot.set(listener.clone());
        let handler = Arc::new(NotificationHandler::new(state.clone(), chain.clone(), slot));
        let controller = RescanController::new(state.clone(), chain.clone(), handler);
        Fixture {
            state,
            chain,
            listener,
            controller,
        }
    }

    #[tokio::test]
    async fn unsynced_wallet_cannot_rescan() {
        let f = fixture(1_000, false);
        for height in [0, 10, 999, 5_000] {
            let res = f.controller.rescan_from_height(height).await;
            assert!(matches!(res, Err(SyncError::InvalidState(_))));
        }
        assert!(matches!(
            f.controller.rescan_all().await,
            Err(SyncError::InvalidState(_))
        ));
        assert_eq!(f.chain.total_calls(), 0);
        assert!(!f.state.is_rescanning());
    }

    #[tokio::test]
    async fn second_rescan_is_refused() {
        let f = fixture(1_000, true);
        f.controller.rescan_from_height(10).await.unwrap();
        let res = f.controller.rescan_from_height(10).await;
        assert!(matches!(res, Err(SyncError::InvalidState(_))));
        assert_eq!(f.chain.filter_registrations().len(), 1);
    }

    #[tokio::test]
    async fn missing_start_block_is_rejected() {
        let f = fixture(1_000, true);
        let res = f.controller.rescan(None, None).await;
        assert!(matches!(res, Err(SyncError::Validation(_))));
        assert!(!f.state.is_rescanning());
        assert_eq!(f.chain.total_calls(), 0);
    }

    #[tokio::test]
    async fn height_past_tip_is_not_found() {
        let f = fixture(1_000, true);
        let res = f.controller.rescan_from_height(1_001).await;
        assert!(matches!(res, Err(SyncError::NotFound { height: 1_001 })));
        assert!(!f.state.is_rescanning());
    }

    #[tokio::test]
    async fn rejected_filter_rolls_back() {
        let f = fixture(1_000, true);
        f.chain.reject_filters("subscription refused");
        let res = f.controller.rescan_all().await;
        match res {
            Err(SyncError::Backend(msg)) => assert_eq!(msg, "subscription refused"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!f.state.is_rescanning());
        assert!(f.chain.rescans_started().is_empty());
        assert_eq!(f.state.handler_status(), HandlerStatus::Stopped);
    }

    #[tokio::test]
    async fn cancel_without_rescan_is_harmless() {
        let f = fixture(1_000, true);
        f.controller.cancel_rescan();
        f.controller.cancel_rescan();
        assert!(!f.state.is_rescanning());
        f.controller.rescan_from_height(5).await.unwrap();
        assert!(f.state.is_rescanning());
    }

    #[tokio::test]
    async fn rescan_runs_until_finished() {
        let f = fixture(500_000, true);
        f.controller.rescan_from_height(100_000).await.unwrap();

        assert!(f.state.is_rescanning());
        let registrations = f.chain.filter_registrations();
        assert_eq!(registrations.len(), 1);
        assert!(registrations[0].is_empty());
        let started = f.chain.rescans_started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].height, 100_000);
        assert_eq!(started[0].hash, MockChainClient::block_at(100_000).block_hash());

        wait_until(|| f.chain.streams_opened() == 1).await;
        f.chain.push(ChainNotification::RescanProgress {
            height: 300_000,
            target: 500_000,
        });
        f.chain.push(ChainNotification::RescanFinished { height: 500_000 });
        wait_until(|| !f.state.is_rescanning()).await;

        let percents = f.listener.rescan_percents();
        assert_eq!(percents, vec![50, 100]);
        assert_eq!(f.listener.completions(), 1);
        // The handler keeps draining after the rescan is done.
        assert_eq!(f.state.handler_status(), HandlerStatus::Started);
    }

    #[tokio::test]
    async fn cancel_stops_rescan_and_disconnects_once() {
        let f = fixture(1_000, true);
        f.controller.rescan_from_height(10).await.unwrap();
        wait_until(|| f.chain.streams_opened() == 1).await;

        f.controller.cancel_rescan();
        assert!(!f.state.is_rescanning());
        assert_eq!(f.chain.disconnects(), 1);

        wait_until(|| f.state.handler_status() == HandlerStatus::Stopped).await;
        assert!(!f.state.is_rescanning());
    }

    #[tokio::test]
    async fn connection_loss_ends_rescan_and_releases_handler() {
        let f = fixture(1_000, true);
        f.controller.rescan_from_height(10).await.unwrap();
        wait_until(|| f.chain.streams_opened() == 1).await;

        f.chain.drop_connection();
        wait_until(|| f.state.handler_status() == HandlerStatus::Stopped).await;
        assert!(!f.state.is_rescanning());

        // Recovery goes through a fresh rescan.
        f.controller.rescan_from_height(10).await.unwrap();
        wait_until(|| f.chain.streams_opened() == 2).await;
        assert!(f.state.is_rescanning());
    }

    #[tokio::test]
    async fn rescan_right_after_cancel_is_not_orphaned() {
        let f = fixture(1_000, true);
        f.controller.rescan_from_height(10).await.unwrap();
        wait_until(|| f.chain.streams_opened() == 1).await;

        f.controller.cancel_rescan();
        f.controller.rescan_from_height(20).await.unwrap();

        wait_until(|| f.chain.streams_opened() == 2).await;
        assert!(f.state.is_rescanning());
        assert_eq!(f.state.handler_status(), HandlerStatus::Started);

        f.chain.push(ChainNotification::RescanFinished { height: 1_000 });
        wait_until(|| !f.state.is_rescanning()).await;
    }

    #[tokio::test]
    async fn concurrent_rescans_start_a_single_handler() {
        let f = Arc::new(fixture(1_000, true));
        let attempts = (0..16)
            .map(|_| {
                let f = f.clone();
                tokio::spawn(async move { f.controller.rescan_from_height(1).await.is_ok() })
            })
            .collect::<Vec<_>>();

        let mut accepted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        wait_until(|| f.chain.streams_opened() == 1).await;
        assert_eq!(f.chain.filter_registrations().len(), 1);
    }

    #[tokio::test]
    async fn start_sync_marks_wallet_synced() {
        let f = fixture(1_000, false);
        assert!(f.controller.start_sync());
        assert!(!f.controller.start_sync());

        wait_until(|| f.chain.streams_opened() == 1).await;
        f.chain.push(ChainNotification::HeadersFetched {
            height: 250,
            target: 1_000,
        });
        f.chain.push(ChainNotification::AddressDiscovery { percent: 40 });
        f.chain.push(ChainNotification::Synced {
            tip: BlockRef::new(1_000, MockChainClient::block_at(1_000).block_hash()),
        });
        wait_until(|| f.state.is_synced()).await;

        assert_eq!(f.listener.header_percents(), vec![25]);
        assert_eq!(f.listener.discovery_percents(), vec![40]);
        assert_eq!(f.listener.completions(), 1);
        assert_eq!(f.state.progress().best_block.map(|b| b.height), Some(1_000));
        f.controller.rescan_all().await.unwrap();
    }

    #[tokio::test]
    async fn backend_errors_do_not_stop_the_handler() {
        let f = fixture(1_000, true);
        f.controller.rescan_from_height(0).await.unwrap();
        wait_until(|| f.chain.streams_opened() == 1).await;

        f.chain.push_error(SyncError::Backend("undecodable block".to_string()));
        let tx = MockChainClient::block_at(3).txdata[0].clone();
        f.chain.push(ChainNotification::RelevantTransaction {
            tx,
            block: Some(BlockRef::new(3, MockChainClient::block_at(3).block_hash())),
        });
        wait_until(|| f.state.progress().relevant_txs == 1).await;
        assert_eq!(f.state.handler_status(), HandlerStatus::Started);
        assert!(f.state.is_rescanning());
    }

    #[tokio::test]
    async fn finish_of_cancelled_rescan_does_not_end_the_next_one() {
        let f = fixture(1_000, true);
        f.controller.rescan_from_height(10).await.unwrap();
        wait_until(|| f.chain.streams_opened() == 1).await;

        // Still buffered on the old stream when the cancel lands.
        f.chain.push(ChainNotification::RescanProgress {
            height: 500,
            target: 1_000,
        });
        f.chain.push(ChainNotification::RescanFinished { height: 1_000 });
        f.controller.cancel_rescan();
        f.controller.rescan_from_height(20).await.unwrap();
        assert!(f.state.is_rescanning());

        wait_until(|| f.chain.streams_opened() == 2).await;
        assert!(f.state.is_rescanning());
        assert_eq!(f.state.handler_status(), HandlerStatus::Started);
        assert_eq!(f.state.progress().rescan_start_height, 20);
        assert_eq!(f.state.progress().rescan_percent, 0);
        assert!(f.listener.rescan_percents().is_empty());
        assert_eq!(f.listener.completions(), 0);

        f.chain.push(ChainNotification::RescanFinished { height: 1_000 });
        wait_until(|| !f.state.is_rescanning()).await;
        assert_eq!(f.listener.completions(), 1);
    }

    #[tokio::test]
    async fn failed_request_of_cancelled_rescan_keeps_the_next_one() {
        let f = Arc::new(fixture(1_000, true));
        f.chain.hold_next_filter();
        let first = {
            let f = f.clone();
            tokio::spawn(async move { f.controller.rescan_from_height(10).await })
        };
        wait_until(|| f.chain.filter_registrations().len() == 1).await;
        assert!(f.state.is_rescanning());

        f.controller.cancel_rescan();
        f.controller.rescan_from_height(5).await.unwrap();

        let res = first.await.unwrap();
        assert!(matches!(res, Err(SyncError::ConnectionLost(_))));
        assert!(f.state.is_rescanning());
        assert_eq!(f.state.progress().rescan_start_height, 5);
        assert_eq!(f.chain.rescans_started().len(), 1);
        assert_eq!(f.chain.rescans_started()[0].height, 5);
    }
}
