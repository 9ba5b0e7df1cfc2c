//! Per-wallet synchronization status.
//!
//! All fields live behind a single read/write lock, except the notification handler's
//! start flag which is a bare atomic so that "is a handler running" can be decided with
//! a compare-and-swap.
//!
//! Two counters tie asynchronous events back to the request they belong to: the rescan
//! epoch grows with every rescan that begins, the stream generation with every cancel.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::chain::BlockRef;
use crate::error::SyncError;

/// Whether a notification handler task currently owns the wallet's stream.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerStatus {
    Stopped = 0,
    Started = 1,
}

/// A copy of the progress counters, taken under the read lock.
#[derive(Clone, Debug, Default)]
pub struct SyncProgress {
    pub synced: bool,
    pub rescanning: bool,
    pub cancelled: bool,
    pub best_block: Option<BlockRef>,
    pub headers_fetched: u32,
    pub headers_target: u32,
    pub headers_started_at: Option<Instant>,
    /// How long the headers stage took, once it completed
    pub headers_fetch_time: Option<Duration>,
    pub discovery_percent: u8,
    pub discovery_started_at: Option<Instant>,
    pub rescan_start_height: u32,
    pub rescan_height: u32,
    pub rescan_target: u32,
    pub rescan_percent: u8,
    pub rescan_started_at: Option<Instant>,
    pub relevant_txs: u64,
}

#[derive(Debug, Default)]
struct SyncData {
    progress: SyncProgress,
    rescan_epoch: u64,
    /// Streams opened before the latest cancel carry a lower generation.
    stream_generation: u64,
}

/// Hosts can read the state but only the rescan controller and the notification handler
/// change it.
///
/// ```compile_fail
/// let state = chainsync::SyncState::new();
/// state.set_synced(true);
/// ```
#[derive(Debug)]
pub struct SyncState {
    data: RwLock<SyncData>,
    started: AtomicU8,
}

pub(crate) fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((u64::from(done.min(total)) * 100) / u64::from(total)) as u8
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(SyncData::default()),
            started: AtomicU8::new(HandlerStatus::Stopped as u8),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SyncData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SyncData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_rescanning(&self) -> bool {
        self.read().progress.rescanning
    }

    pub fn is_synced(&self) -> bool {
        self.read().progress.synced
    }

    pub fn is_cancelled(&self) -> bool {
        self.read().progress.cancelled
    }

    pub fn progress(&self) -> SyncProgress {
        self.read().progress.clone()
    }

    pub(crate) fn set_synced(&self, synced: bool) {
        self.write().progress.synced = synced;
    }

    /// Fails unless the wallet is synced and not already rescanning.
    pub fn check_can_rescan(&self) -> Result<(), SyncError> {
        Self::rescan_precondition(&self.read().progress)
    }

    fn rescan_precondition(progress: &SyncProgress) -> Result<(), SyncError> {
        if progress.rescanning {
            return Err(SyncError::invalid_state("a rescan is already in progress"));
        }
        if !progress.synced {
            return Err(SyncError::invalid_state("wallet is not synced"));
        }
        Ok(())
    }

    pub(crate) fn begin_rescan(&self) -> Result<u64, SyncError> {
        self.begin_rescan_from(0)
    }

    /// Returns the epoch of the new rescan.
    pub(crate) fn begin_rescan_from(&self, start_height: u32) -> Result<u64, SyncError> {
        let mut data = self.write();
        Self::rescan_precondition(&data.progress)?;
        data.rescan_epoch += 1;
        let progress = &mut data.progress;
        progress.rescanning = true;
        progress.cancelled = false;
        progress.rescan_start_height = start_height;
        progress.rescan_height = start_height;
        progress.rescan_target = 0;
        progress.rescan_percent = 0;
        progress.rescan_started_at = Some(Instant::now());
        Ok(data.rescan_epoch)
    }

    /// Ends the rescan begun at `epoch`. Idempotent, and a newer rescan is left alone.
    pub(crate) fn end_rescan(&self, epoch: u64) -> bool {
        let mut data = self.write();
        if data.rescan_epoch != epoch || !data.progress.rescanning {
            return false;
        }
        data.progress.rescanning = false;
        true
    }

    /// Also makes every stream opened so far stale.
    pub(crate) fn cancel_rescan(&self) {
        let mut data = self.write();
        data.progress.rescanning = false;
        data.progress.cancelled = true;
        data.stream_generation += 1;
    }

    pub(crate) fn stream_generation(&self) -> u64 {
        self.read().stream_generation
    }

    pub(crate) fn compare_and_set_started(&self, from: HandlerStatus, to: HandlerStatus) -> bool {
        self.started
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn handler_status(&self) -> HandlerStatus {
        if self.started.load(Ordering::Acquire) == HandlerStatus::Started as u8 {
            HandlerStatus::Started
        } else {
            HandlerStatus::Stopped
        }
    }

    pub(crate) fn rescan_epoch(&self) -> u64 {
        self.read().rescan_epoch
    }

    /// Called by an exiting handler. Resets the start flag and clears the active rescan
    /// if the connection was `lost`, or if it was closed and no newer rescan began since
    /// `epoch` was read. Returns whether a rescan is still active and needs a handler.
    pub(crate) fn release_handler(&self, epoch: u64, lost: bool) -> bool {
        let mut data = self.write();
        if data.progress.rescanning && (lost || data.rescan_epoch == epoch) {
            log::warn!("Notification stream ended before the rescan finished");
            data.progress.rescanning = false;
        }
        self.started
            .store(HandlerStatus::Stopped as u8, Ordering::Release);
        data.progress.rescanning
    }

    pub(crate) fn update_headers(&self, height: u32, target: u32) {
        let mut data = self.write();
        let progress = &mut data.progress;
        let started = *progress.headers_started_at.get_or_insert_with(Instant::now);
        progress.headers_fetched = height;
        progress.headers_target = target.max(height);
        if height >= target && progress.headers_fetch_time.is_none() {
            progress.headers_fetch_time = Some(started.elapsed());
        }
    }

    pub(crate) fn update_discovery(&self, percent: u8) {
        let mut data = self.write();
        data.progress
            .discovery_started_at
            .get_or_insert_with(Instant::now);
        data.progress.discovery_percent = percent.min(100);
    }

    /// Returns false if the update belongs to a cancelled or finished rescan, or arrived
    /// on a stream of an older `generation`.
    pub(crate) fn update_rescan(&self, generation: u64, height: u32, target: u32) -> bool {
        let mut data = self.write();
        if data.stream_generation != generation {
            return false;
        }
        let progress = &mut data.progress;
        if !progress.rescanning {
            return false;
        }
        progress.rescan_height = height;
        progress.rescan_target = target;
        progress.rescan_percent = percent(
            height.saturating_sub(progress.rescan_start_height),
            target.saturating_sub(progress.rescan_start_height),
        );
        true
    }

    /// Returns false if no rescan was running or the stream is stale.
    pub(crate) fn finish_rescan(&self, generation: u64, height: u32) -> bool {
        let mut data = self.write();
        if data.stream_generation != generation {
            return false;
        }
        let progress = &mut data.progress;
        if !progress.rescanning {
            return false;
        }
        progress.rescanning = false;
        progress.rescan_height = height;
        progress.rescan_target = progress.rescan_target.max(height);
        progress.rescan_percent = 100;
        true
    }

    pub(crate) fn block_connected(&self, block: BlockRef) {
        self.write().progress.best_block = Some(block);
    }

    pub(crate) fn block_disconnected(&self, block: &BlockRef) {
        let mut data = self.write();
        if data.progress.best_block.as_ref() == Some(block) {
            data.progress.best_block = None;
        }
    }

    pub(crate) fn record_relevant_tx(&self) {
        self.write().progress.relevant_txs += 1;
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}
