//! In-memory chain backend and helpers for exercising the sync core without a node.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, block, transaction, Address, Amount, Block, BlockHash, CompactTarget, OutPoint,
    ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode, TxOut, Witness,
};

use crate::chain::{BlockRef, ChainClient, NotificationSender, NotificationStream};
use crate::error::SyncError;
use crate::notification::ChainNotification;
use crate::progress::{ProgressListener, ProgressSnapshot, Stage};

#[derive(Default)]
struct MockState {
    known: HashMap<BlockHash, u32>,
    resolves: usize,
    fetches: usize,
    registrations: Vec<HashSet<Address>>,
    rescans: Vec<BlockRef>,
    streams_opened: usize,
    disconnects: usize,
    filter_rejection: Option<String>,
    /// The next filter registration waits for a disconnect, then fails
    held_filter: Option<CancellationToken>,
    sender: Option<NotificationSender>,
}

/// A scripted [`ChainClient`]. Tests push notifications into the currently open stream
/// and inspect which calls the sync core made.
pub struct MockChainClient {
    tip: u32,
    state: Mutex<MockState>,
}

impl MockChainClient {
    pub fn new(tip: u32) -> Self {
        Self {
            tip,
            state: Mutex::new(MockState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The deterministic block the mock serves at `height`, with a single coinbase.
    pub fn block_at(height: u32) -> Block {
        let coinbase = Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(height.to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50 * 100_000_000),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        let mut block = Block {
            header: block::Header {
                version: block::Version::ONE,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_231_006_505 + height * 600,
                bits: CompactTarget::from_consensus(0x1d00ffff),
                nonce: height,
            },
            txdata: vec![coinbase],
        };
        if let Some(root) = block.compute_merkle_root() {
            block.header.merkle_root = root;
        }
        block
    }

    pub fn reject_filters(&self, reason: &str) {
        self.lock().filter_rejection = Some(reason.to_string());
    }

    /// Make the next filter registration hang until [`ChainClient::disconnect`], like a
    /// request cut off by the connection shutting down.
    pub fn hold_next_filter(&self) {
        self.lock().held_filter = Some(CancellationToken::new());
    }

    /// Deliver a notification on the open stream. Returns false if none is open.
    pub fn push(&self, notification: ChainNotification) -> bool {
        self.send(Ok(notification))
    }

    pub fn push_error(&self, error: SyncError) -> bool {
        self.send(Err(error))
    }

    fn send(&self, item: Result<ChainNotification, SyncError>) -> bool {
        match self.lock().sender.as_ref() {
            Some(sender) => sender.send(item).is_ok(),
            None => false,
        }
    }

    /// Simulate the backend going away on its own.
    pub fn drop_connection(&self) {
        if let Some(sender) = self.lock().sender.take() {
            let _ = sender.send(Err(SyncError::ConnectionLost(
                "backend closed the connection".to_string(),
            )));
        }
    }

    pub fn filter_registrations(&self) -> Vec<HashSet<Address>> {
        self.lock().registrations.clone()
    }

    pub fn rescans_started(&self) -> Vec<BlockRef> {
        self.lock().rescans.clone()
    }

    pub fn streams_opened(&self) -> usize {
        self.lock().streams_opened
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    pub fn total_calls(&self) -> usize {
        let state = self.lock();
        state.resolves
            + state.fetches
            + state.registrations.len()
            + state.rescans.len()
            + state.streams_opened
            + state.disconnects
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn resolve_block_hash(&self, height: u32) -> Result<BlockHash, SyncError> {
        let mut state = self.lock();
        state.resolves += 1;
        if height > self.tip {
            return Err(SyncError::NotFound { height });
        }
        let hash = Self::block_at(height).block_hash();
        state.known.insert(hash, height);
        Ok(hash)
    }

    async fn fetch_block(&self, hash: &BlockHash) -> Result<Block, SyncError> {
        let mut state = self.lock();
        state.fetches += 1;
        match state.known.get(hash) {
            Some(height) => Ok(Self::block_at(*height)),
            None => Err(SyncError::Backend(format!("unknown block {}", hash))),
        }
    }

    async fn register_address_filter(&self, addrs: &HashSet<Address>) -> Result<(), SyncError> {
        let held = {
            let mut state = self.lock();
            state.registrations.push(addrs.clone());
            state.held_filter.clone()
        };
        if let Some(token) = held {
            token.cancelled().await;
            return Err(SyncError::ConnectionLost(
                "disconnected during filter registration".to_string(),
            ));
        }

        let state = self.lock();
        match &state.filter_rejection {
            Some(reason) => Err(SyncError::Backend(reason.clone())),
            None => Ok(()),
        }
    }

    async fn start_rescan(&self, from: &BlockRef) -> Result<(), SyncError> {
        self.lock().rescans.push(*from);
        Ok(())
    }

    async fn notification_stream(&self) -> Result<NotificationStream, SyncError> {
        let (sender, stream) = NotificationStream::channel();
        let mut state = self.lock();
        state.streams_opened += 1;
        state.sender = Some(sender);
        Ok(stream)
    }

    fn disconnect(&self) {
        let mut state = self.lock();
        state.disconnects += 1;
        state.sender = None;
        if let Some(token) = state.held_filter.take() {
            token.cancel();
        }
    }
}

#[derive(Debug)]
pub enum ListenerEvent {
    Progress(Stage, u8),
    SyncCompleted,
}

/// Records every callback it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    fn record(&self, event: ListenerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn percents(&self, stage: Stage) -> Vec<u8> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Progress(s, pct) if *s == stage => Some(*pct),
                _ => None,
            })
            .collect()
    }

    pub fn header_percents(&self) -> Vec<u8> {
        self.percents(Stage::HeadersFetch)
    }

    pub fn discovery_percents(&self) -> Vec<u8> {
        self.percents(Stage::AddressDiscovery)
    }

    pub fn rescan_percents(&self) -> Vec<u8> {
        self.percents(Stage::Rescan)
    }

    pub fn completions(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| matches!(e, ListenerEvent::SyncCompleted))
            .count()
    }
}

impl ProgressListener for RecordingListener {
    fn on_headers_fetch_progress(&self, snapshot: &ProgressSnapshot) {
        self.record(ListenerEvent::Progress(snapshot.stage, snapshot.percent));
    }

    fn on_rescan_progress(&self, snapshot: &ProgressSnapshot) {
        self.record(ListenerEvent::Progress(snapshot.stage, snapshot.percent));
    }

    fn on_address_discovery_progress(&self, snapshot: &ProgressSnapshot) {
        self.record(ListenerEvent::Progress(snapshot.stage, snapshot.percent));
    }

    fn on_sync_completed(&self) {
        self.record(ListenerEvent::SyncCompleted);
    }
}

/// Yield to the runtime until `condition` holds. Panics after five seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within 5 seconds");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
