//! [`ChainClient`] backed by a bitcoind node.
//!
//! bitcoind has no push interface over JSON-RPC, so each notification stream is fed by a
//! session task that polls the node for new blocks and serves rescan requests. Address
//! filtering happens client side, against the scripts of the registered addresses and
//! the outpoints they received.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Address, Block, BlockHash, OutPoint, ScriptBuf, Transaction};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::chain::{BlockRef, ChainClient, NotificationSender, NotificationStream};
use crate::config::SyncConfig;
use crate::connection::{blocking, BitcoindRpc, ChainInfo, Connection};
use crate::error::SyncError;
use crate::notification::ChainNotification;

/// What the wallet is watching for.
#[derive(Debug, Default)]
pub(crate) struct Filter {
    registered: bool,
    scripts: HashSet<ScriptBuf>,
    outpoints: HashSet<OutPoint>,
}

impl Filter {
    fn watch(&mut self, addrs: &HashSet<Address>) {
        self.scripts.extend(addrs.iter().map(Address::script_pubkey));
        self.registered = true;
    }

    /// Transactions of `block` paying to a watched script or spending a watched
    /// outpoint. Outputs paying to us become watched outpoints.
    fn scan_block(&mut self, block: &Block) -> Vec<Transaction> {
        let mut relevant = Vec::new();
        for tx in &block.txdata {
            let txid = tx.compute_txid();
            let mut relevant_tx = false;
            for input in &tx.input {
                relevant_tx |= self.outpoints.remove(&input.previous_output);
            }
            for (vout, output) in tx.output.iter().enumerate() {
                if self.scripts.contains(&output.script_pubkey) {
                    self.outpoints.insert(OutPoint::new(txid, vout as u32));
                    relevant_tx = true;
                }
            }
            if relevant_tx {
                relevant.push(tx.clone());
            }
        }
        relevant
    }
}

#[derive(Default)]
struct Shared {
    filter: RwLock<Filter>,
    pending_rescan: Mutex<Option<BlockRef>>,
    rescan_requested: Notify,
    session: Mutex<Option<CancellationToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn take_pending_rescan(&self) -> Option<BlockRef> {
        lock(&self.pending_rescan).take()
    }
}

pub struct BitcoindChainClient {
    rpc: Arc<dyn BitcoindRpc>,
    shared: Arc<Shared>,
    poll_interval: Duration,
    progress_interval: u32,
}

impl BitcoindChainClient {
    pub async fn connect(config: &SyncConfig) -> Result<Self, SyncError> {
        let conn = Connection::connect(&config.bitcoind).await?;
        Ok(Self::with_rpc(
            conn,
            config.poll_interval,
            config.progress_interval,
        ))
    }

    pub(crate) fn with_rpc(
        rpc: Arc<dyn BitcoindRpc>,
        poll_interval: Duration,
        progress_interval: u32,
    ) -> Self {
        Self {
            rpc,
            shared: Arc::new(Shared::default()),
            poll_interval,
            progress_interval,
        }
    }
}

#[async_trait]
impl ChainClient for BitcoindChainClient {
    async fn resolve_block_hash(&self, height: u32) -> Result<BlockHash, SyncError> {
        blocking(&self.rpc, move |c| c.block_hash(height)).await
    }

    async fn fetch_block(&self, hash: &BlockHash) -> Result<Block, SyncError> {
        let hash = *hash;
        blocking(&self.rpc, move |c| c.block(&hash)).await
    }

    async fn register_address_filter(&self, addrs: &HashSet<Address>) -> Result<(), SyncError> {
        let mut filter = self
            .shared
            .filter
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if addrs.is_empty() {
            if !filter.registered {
                return Err(SyncError::Backend(
                    "no address filter was registered for this wallet".to_string(),
                ));
            }
            log::debug!("Keeping the registered filter of {} scripts", filter.scripts.len());
            return Ok(());
        }
        filter.watch(addrs);
        log::info!(
            "Watching {} new addresses ({} scripts in filter)",
            addrs.len(),
            filter.scripts.len()
        );
        Ok(())
    }

    async fn start_rescan(&self, from: &BlockRef) -> Result<(), SyncError> {
        *lock(&self.shared.pending_rescan) = Some(*from);
        self.shared.rescan_requested.notify_one();
        Ok(())
    }

    async fn notification_stream(&self) -> Result<NotificationStream, SyncError> {
        let (sender, stream) = NotificationStream::channel();
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.shared.session).replace(token.clone()) {
            log::debug!("Closing previous notification session");
            previous.cancel();
        }

        let session = Session {
            rpc: self.rpc.clone(),
            shared: self.shared.clone(),
            sender,
            token,
            poll_interval: self.poll_interval,
            progress_interval: self.progress_interval.max(1),
            tip: None,
            reported_headers: None,
            synced: false,
        };
        tokio::spawn(session.run());
        Ok(stream)
    }

    fn disconnect(&self) {
        if let Some(token) = lock(&self.shared.session).take() {
            log::info!("Disconnecting notification session");
            token.cancel();
        }
        self.shared.take_pending_rescan();
    }
}

/// Feeds one notification stream until cancelled or until bitcoind fails.
struct Session {
    rpc: Arc<dyn BitcoindRpc>,
    shared: Arc<Shared>,
    sender: NotificationSender,
    token: CancellationToken,
    poll_interval: Duration,
    progress_interval: u32,
    tip: Option<BlockRef>,
    reported_headers: Option<(u32, u32)>,
    synced: bool,
}

impl Session {
    async fn run(mut self) {
        match self.serve().await {
            Ok(()) => log::debug!("Notification session closed"),
            Err(e) => {
                log::warn!("Notification session lost: {}", e);
                let _ = self.sender.send(Err(SyncError::ConnectionLost(e.to_string())));
            }
        }
    }

    fn notify(&self, notification: ChainNotification) {
        if self.sender.send(Ok(notification)).is_err() {
            // Nobody is reading anymore.
            self.token.cancel();
        }
    }

    async fn serve(&mut self) -> Result<(), SyncError> {
        let shared = self.shared.clone();
        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }
            if let Some(start) = shared.take_pending_rescan() {
                self.rescan(start).await?;
                continue;
            }
            self.poll().await?;

            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                _ = shared.rescan_requested.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn poll(&mut self) -> Result<(), SyncError> {
        let info = blocking(&self.rpc, |c| c.chain_info()).await?;
        self.report_headers(&info);

        match self.tip {
            None => self.tip = Some(BlockRef::new(info.blocks, info.best_block_hash)),
            Some(tip) if tip.hash == info.best_block_hash => {}
            Some(tip) => self.follow_tip(tip, info.blocks).await?,
        }

        if !self.synced && !info.initial_block_download && info.blocks == info.headers {
            if let Some(tip) = self.tip {
                self.synced = true;
                self.notify(ChainNotification::Synced { tip });
            }
        }
        Ok(())
    }

    fn report_headers(&mut self, info: &ChainInfo) {
        let headers = (info.blocks, info.headers);
        if self.reported_headers != Some(headers) {
            self.reported_headers = Some(headers);
            self.notify(ChainNotification::HeadersFetched {
                height: info.blocks,
                target: info.headers,
            });
        }
    }

    /// Disconnect our blocks that left the best chain, then connect up to `best_height`.
    async fn follow_tip(&mut self, mut tip: BlockRef, best_height: u32) -> Result<(), SyncError> {
        loop {
            let hash = tip.hash;
            let header = blocking(&self.rpc, move |c| c.header_info(&hash)).await?;
            if header.confirmations >= 0 {
                break;
            }
            self.notify(ChainNotification::BlockDisconnected(tip));
            let previous = header.previous.ok_or_else(|| {
                SyncError::Backend(format!("block {} without parent left the chain", tip.hash))
            })?;
            tip = BlockRef::new(header.height.saturating_sub(1), previous);
            self.tip = Some(tip);
        }

        for height in tip.height + 1..=best_height {
            if self.token.is_cancelled() {
                return Ok(());
            }
            let (block_ref, block) = self.block_at(height).await?;
            self.report_relevant(&block, block_ref);
            self.notify(ChainNotification::BlockConnected(block_ref));
            self.tip = Some(block_ref);
        }
        Ok(())
    }

    async fn rescan(&mut self, start: BlockRef) -> Result<(), SyncError> {
        let target = blocking(&self.rpc, |c| c.chain_info()).await?.blocks;
        log::info!("Rescanning blocks {} to {}", start.height, target);

        for height in start.height..=target {
            if self.token.is_cancelled() {
                log::info!("Rescan interrupted at height {}", height);
                return Ok(());
            }
            let (block_ref, block) = if height == start.height {
                let hash = start.hash;
                (start, blocking(&self.rpc, move |c| c.block(&hash)).await?)
            } else {
                self.block_at(height).await?
            };
            self.report_relevant(&block, block_ref);

            if (height - start.height) % self.progress_interval == 0 && height != target {
                self.notify(ChainNotification::RescanProgress { height, target });
            }
        }

        self.notify(ChainNotification::RescanFinished {
            height: target.max(start.height),
        });
        Ok(())
    }

    async fn block_at(&self, height: u32) -> Result<(BlockRef, Block), SyncError> {
        let hash = blocking(&self.rpc, move |c| c.block_hash(height)).await?;
        let block = blocking(&self.rpc, move |c| c.block(&hash)).await?;
        Ok((BlockRef::new(height, hash), block))
    }

    fn report_relevant(&self, block: &Block, block_ref: BlockRef) {
        let relevant = self
            .shared
            .filter
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .scan_block(block);
        for tx in relevant {
            self.notify(ChainNotification::RelevantTransaction {
                tx,
                block: Some(block_ref),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HeaderInfo;
    use crate::error::{BitcoindError, ResponseErrorKind};
    use crate::testutils::MockChainClient;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, Network, Sequence, TxIn, TxOut, Witness};
    use std::collections::HashMap;
    use std::str::FromStr;

    #[derive(Default)]
    struct NodeChain {
        best: Vec<Block>,
        known: HashMap<BlockHash, (u32, Block)>,
        headers_ahead: u32,
    }

    /// A bitcoind answering from an in-memory chain. Blocks that leave the best chain
    /// stay known, as stale blocks do in bitcoind.
    #[derive(Default)]
    struct DummyNode {
        chain: Mutex<NodeChain>,
    }

    impl DummyNode {
        fn with_height(tip: u32) -> Arc<Self> {
            let node = Arc::new(Self::default());
            node.extend_from(0, tip, 0);
            node
        }

        /// Replace the best chain from `height` on with blocks up to `tip`. A non-zero
        /// `fork` yields blocks distinct from the ones it replaces.
        fn extend_from(&self, height: u32, tip: u32, fork: u32) {
            let mut chain = lock(&self.chain);
            chain.best.truncate(height as usize);
            for h in height..=tip {
                let mut block = MockChainClient::block_at(h);
                block.header.nonce = h + fork * 1_000_000;
                block.header.prev_blockhash = chain
                    .best
                    .last()
                    .map(Block::block_hash)
                    .unwrap_or_else(BlockHash::all_zeros);
                chain.known.insert(block.block_hash(), (h, block.clone()));
                chain.best.push(block);
            }
        }

        fn add_tx(&self, height: u32, tx: Transaction) {
            let mut guard = lock(&self.chain);
            let chain = &mut *guard;
            let block = &mut chain.best[height as usize];
            block.txdata.push(tx);
            chain.known.insert(block.block_hash(), (height, block.clone()));
        }

        fn set_headers_ahead(&self, count: u32) {
            lock(&self.chain).headers_ahead = count;
        }

        fn at(&self, height: u32) -> BlockRef {
            BlockRef::new(height, lock(&self.chain).best[height as usize].block_hash())
        }
    }

    impl BitcoindRpc for DummyNode {
        fn chain_info(&self) -> Result<ChainInfo, BitcoindError> {
            let chain = lock(&self.chain);
            let tip = chain.best.len() as u32 - 1;
            Ok(ChainInfo {
                blocks: tip,
                headers: tip + chain.headers_ahead,
                best_block_hash: chain.best[tip as usize].block_hash(),
                initial_block_download: chain.headers_ahead > 0,
            })
        }

        fn block_hash(&self, height: u32) -> Result<BlockHash, BitcoindError> {
            lock(&self.chain)
                .best
                .get(height as usize)
                .map(Block::block_hash)
                .ok_or(BitcoindError::HeightOutOfRange(height))
        }

        fn block(&self, hash: &BlockHash) -> Result<Block, BitcoindError> {
            lock(&self.chain)
                .known
                .get(hash)
                .map(|(_, block)| block.clone())
                .ok_or_else(|| BitcoindError::response_error(ResponseErrorKind::InvalidBlockData))
        }

        fn header_info(&self, hash: &BlockHash) -> Result<HeaderInfo, BitcoindError> {
            let chain = lock(&self.chain);
            let (height, block) = chain
                .known
                .get(hash)
                .ok_or_else(|| BitcoindError::response_error(ResponseErrorKind::InvalidHash))?;
            let tip = chain.best.len() as u32 - 1;
            let in_best = chain.best.get(*height as usize).map(Block::block_hash) == Some(*hash);
            Ok(HeaderInfo {
                height: *height,
                confirmations: if in_best {
                    i64::from(tip - height + 1)
                } else {
                    -1
                },
                previous: (*height > 0).then_some(block.header.prev_blockhash),
            })
        }
    }

    fn client(node: &Arc<DummyNode>, progress_interval: u32) -> BitcoindChainClient {
        BitcoindChainClient::with_rpc(node.clone(), Duration::from_millis(10), progress_interval)
    }

    async fn next(stream: &mut NotificationStream) -> ChainNotification {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("no notification in time")
            .expect("stream closed")
            .expect("stream error")
    }

    fn address() -> Address {
        Address::from_str("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq")
            .unwrap()
            .require_network(Network::Bitcoin)
            .unwrap()
    }

    fn paying(prev: OutPoint, script: ScriptBuf) -> Transaction {
        let mut tx = MockChainClient::block_at(1).txdata[0].clone();
        tx.input = vec![TxIn {
            previous_output: prev,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }];
        tx.output = vec![TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: script,
        }];
        tx
    }

    #[test]
    fn filter_tracks_received_and_spent_outputs() {
        let mut filter = Filter::default();
        filter.watch(&HashSet::from([address()]));
        assert!(filter.registered);

        let mut block = MockChainClient::block_at(10);
        let receive = paying(OutPoint::null(), address().script_pubkey());
        let unrelated = paying(OutPoint::null(), ScriptBuf::new());
        block.txdata.push(receive.clone());
        block.txdata.push(unrelated);

        let found = filter.scan_block(&block);
        assert_eq!(found, vec![receive.clone()]);
        let received = OutPoint::new(receive.compute_txid(), 0);
        assert!(filter.outpoints.contains(&received));

        let mut next = MockChainClient::block_at(11);
        let spend = paying(received, ScriptBuf::new());
        next.txdata.push(spend.clone());
        assert_eq!(filter.scan_block(&next), vec![spend]);
        assert!(filter.outpoints.is_empty());
    }

    #[test]
    fn empty_filter_finds_nothing() {
        let mut filter = Filter::default();
        assert!(filter.scan_block(&MockChainClient::block_at(5)).is_empty());
        assert!(!filter.registered);
    }

    #[tokio::test]
    async fn synced_once_headers_are_caught_up() {
        let node = DummyNode::with_height(5);
        node.set_headers_ahead(5);
        let chain = client(&node, 1);
        let mut stream = chain.notification_stream().await.unwrap();

        assert_eq!(
            next(&mut stream).await,
            ChainNotification::HeadersFetched {
                height: 5,
                target: 10
            }
        );
        node.set_headers_ahead(0);
        assert_eq!(
            next(&mut stream).await,
            ChainNotification::HeadersFetched {
                height: 5,
                target: 5
            }
        );
        assert_eq!(
            next(&mut stream).await,
            ChainNotification::Synced { tip: node.at(5) }
        );
    }

    #[tokio::test]
    async fn reorg_disconnects_stale_blocks_then_connects_new_ones() {
        let node = DummyNode::with_height(5);
        let chain = client(&node, 1);
        let mut stream = chain.notification_stream().await.unwrap();
        next(&mut stream).await;
        assert_eq!(
            next(&mut stream).await,
            ChainNotification::Synced { tip: node.at(5) }
        );

        let (old4, old5) = (node.at(4), node.at(5));
        node.extend_from(4, 6, 1);
        assert_ne!(node.at(4), old4);

        assert_eq!(
            next(&mut stream).await,
            ChainNotification::HeadersFetched {
                height: 6,
                target: 6
            }
        );
        assert_eq!(
            next(&mut stream).await,
            ChainNotification::BlockDisconnected(old5)
        );
        assert_eq!(
            next(&mut stream).await,
            ChainNotification::BlockDisconnected(old4)
        );
        for height in 4..=6 {
            assert_eq!(
                next(&mut stream).await,
                ChainNotification::BlockConnected(node.at(height))
            );
        }
    }

    #[tokio::test]
    async fn rescan_reports_every_interval_and_finishes_at_tip() {
        let node = DummyNode::with_height(10);
        let receive = paying(OutPoint::null(), address().script_pubkey());
        node.add_tx(7, receive.clone());
        let chain = client(&node, 3);
        chain
            .register_address_filter(&HashSet::from([address()]))
            .await
            .unwrap();

        let mut stream = chain.notification_stream().await.unwrap();
        next(&mut stream).await;
        next(&mut stream).await;
        chain.start_rescan(&node.at(1)).await.unwrap();

        let expected = vec![
            ChainNotification::RescanProgress {
                height: 1,
                target: 10,
            },
            ChainNotification::RescanProgress {
                height: 4,
                target: 10,
            },
            ChainNotification::RelevantTransaction {
                tx: receive,
                block: Some(node.at(7)),
            },
            ChainNotification::RescanProgress {
                height: 7,
                target: 10,
            },
            ChainNotification::RescanFinished { height: 10 },
        ];
        for notification in expected {
            assert_eq!(next(&mut stream).await, notification);
        }
    }

    #[tokio::test]
    async fn disconnect_drops_pending_rescan_and_ends_stream() {
        let node = DummyNode::with_height(3);
        let chain = client(&node, 1);
        assert!(matches!(
            chain.register_address_filter(&HashSet::new()).await,
            Err(SyncError::Backend(_))
        ));

        chain.start_rescan(&node.at(0)).await.unwrap();
        chain.disconnect();
        assert!(chain.shared.take_pending_rescan().is_none());

        let mut stream = chain.notification_stream().await.unwrap();
        assert_eq!(
            next(&mut stream).await,
            ChainNotification::HeadersFetched {
                height: 3,
                target: 3
            }
        );
        assert_eq!(
            next(&mut stream).await,
            ChainNotification::Synced { tip: node.at(3) }
        );
        let idle = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(idle.is_err(), "no rescan should run");

        chain.disconnect();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
