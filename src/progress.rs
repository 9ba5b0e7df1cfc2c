//! Progress reporting towards the host application.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::{percent, SyncProgress};

// Share of the total header fetch time that address discovery usually takes.
const DISCOVERY_PERCENTAGE: f64 = 0.8;

// Share of the total header fetch time that a rescan usually takes.
const RESCAN_PERCENTAGE: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Stage {
    HeadersFetch,
    AddressDiscovery,
    Rescan,
}

/// Point-in-time view of one sync stage, handed to a [`ProgressListener`].
#[derive(Clone, Debug, Serialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub percent: u8,
    pub current_height: u32,
    pub target_height: u32,
    /// Estimated time left in this stage
    pub time_remaining: Duration,
    /// Estimated time left until the wallet is fully synced
    pub total_time_remaining: Duration,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub(crate) fn headers(progress: &SyncProgress, now: Instant) -> Self {
        let pct = percent(progress.headers_fetched, progress.headers_target);
        let elapsed = elapsed_since(progress.headers_started_at, now);
        let remaining = stage_remaining(elapsed, pct);
        // Whatever follows the header fetch is estimated from its own projected length.
        let projected = remaining + elapsed;
        let following = projected.mul_f64(DISCOVERY_PERCENTAGE + RESCAN_PERCENTAGE);
        Self::build(
            Stage::HeadersFetch,
            pct,
            progress.headers_fetched,
            progress.headers_target,
            remaining,
            remaining + following,
        )
    }

    pub(crate) fn discovery(progress: &SyncProgress, now: Instant) -> Self {
        let pct = progress.discovery_percent;
        let remaining = stage_remaining(elapsed_since(progress.discovery_started_at, now), pct);
        let rescan = progress
            .headers_fetch_time
            .map(|d| d.mul_f64(RESCAN_PERCENTAGE))
            .unwrap_or_default();
        Self::build(
            Stage::AddressDiscovery,
            pct,
            progress.headers_fetched,
            progress.headers_target,
            remaining,
            remaining + rescan,
        )
    }

    pub(crate) fn rescan(progress: &SyncProgress, now: Instant) -> Self {
        let pct = progress.rescan_percent;
        let remaining = stage_remaining(elapsed_since(progress.rescan_started_at, now), pct);
        Self::build(
            Stage::Rescan,
            pct,
            progress.rescan_height,
            progress.rescan_target,
            remaining,
            remaining,
        )
    }

    fn build(
        stage: Stage,
        percent: u8,
        current_height: u32,
        target_height: u32,
        time_remaining: Duration,
        total_time_remaining: Duration,
    ) -> Self {
        Self {
            stage,
            percent,
            current_height,
            target_height,
            time_remaining,
            total_time_remaining,
            emitted_at: Utc::now(),
        }
    }

    /// "3 min" or "42 sec".
    pub fn time_remaining_label(&self) -> String {
        format_remaining(self.total_time_remaining)
    }
}

fn elapsed_since(start: Option<Instant>, now: Instant) -> Duration {
    start
        .map(|s| now.saturating_duration_since(s))
        .unwrap_or_default()
}

fn stage_remaining(elapsed: Duration, pct: u8) -> Duration {
    if pct == 0 || pct >= 100 {
        return Duration::ZERO;
    }
    elapsed.mul_f64(f64::from(100 - pct) / f64::from(pct))
}

pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    let minutes = secs / 60;
    if minutes > 0 {
        format!("{} min", minutes)
    } else {
        format!("{} sec", secs)
    }
}

/// Receives sync progress. Called from the notification task, never with a lock held.
pub trait ProgressListener: Send + Sync {
    fn on_headers_fetch_progress(&self, snapshot: &ProgressSnapshot);

    fn on_rescan_progress(&self, snapshot: &ProgressSnapshot);

    fn on_address_discovery_progress(&self, snapshot: &ProgressSnapshot);

    fn on_sync_completed(&self);
}

/// Holds at most one listener; setting a new one replaces the old.
#[derive(Clone, Default)]
pub struct ListenerSlot {
    listener: Arc<RwLock<Option<Arc<dyn ProgressListener>>>>,
}

impl ListenerSlot {
    pub fn set(&self, listener: Arc<dyn ProgressListener>) {
        *self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn clear(&self) {
        self.listener
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn get(&self) -> Option<Arc<dyn ProgressListener>> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
