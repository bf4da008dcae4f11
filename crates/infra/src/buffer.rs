//! Telemetry buffer: accumulates readings and writes them in batches.
//!
//! `add` only touches memory. A flush swaps the pending readings out under the
//! lock, releases it, then writes to the store in chunks of at most
//! [`MAX_BATCH_SIZE`]. A failed chunk and everything after it is merged back to
//! the front of the buffer; chunks already written stay written (at-least-once).
//! The buffer never holds more than `2 × max_size` readings: the oldest are
//! dropped first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use wattloop_telemetry::{MAX_BATCH_SIZE, TelemetryBatch, TelemetryReading};

use crate::telemetry_store::{TelemetryStore, TelemetryStoreError};
use crate::worker::WorkerHandle;

pub const DEFAULT_MAX_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Size that triggers an immediate flush.
    pub max_size: usize,
    /// Period of the background flush.
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl BufferConfig {
    /// Hard cap on buffered readings while the store is failing.
    pub fn capacity(&self) -> usize {
        self.max_size.saturating_mul(2)
    }
}

/// Point-in-time buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub pending: usize,
    pub written: u64,
    pub dropped: u64,
    pub failed_flushes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed_flushes: AtomicU64,
}

pub struct TelemetryBuffer {
    store: Arc<dyn TelemetryStore>,
    config: BufferConfig,
    pending: Mutex<VecDeque<TelemetryReading>>,
    flush_requested: Notify,
    counters: Counters,
}

impl std::fmt::Debug for TelemetryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBuffer")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TelemetryBuffer {
    pub fn new(store: Arc<dyn TelemetryStore>, config: BufferConfig) -> Self {
        let config = BufferConfig {
            max_size: config.max_size.max(1),
            ..config
        };
        Self {
            store,
            config,
            pending: Mutex::new(VecDeque::with_capacity(config.max_size)),
            flush_requested: Notify::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> BufferConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TelemetryReading>> {
        // A panic while holding the lock cannot leave the queue half-updated.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.len(),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed_flushes: self.counters.failed_flushes.load(Ordering::Relaxed),
        }
    }

    /// Append one reading. Reaching `max_size` wakes the flusher.
    pub fn add(&self, reading: TelemetryReading) {
        self.extend(std::iter::once(reading));
    }

    /// Append readings in order. Reaching `max_size` wakes the flusher.
    pub fn extend(&self, readings: impl IntoIterator<Item = TelemetryReading>) {
        let (len, dropped) = {
            let mut pending = self.lock();
            pending.extend(readings);
            let dropped = Self::enforce_capacity(&mut pending, self.config.capacity());
            (pending.len(), dropped)
        };

        self.record_dropped(dropped);
        if len >= self.config.max_size {
            self.flush_requested.notify_one();
        }
    }

    /// Write everything currently buffered.
    ///
    /// Returns the number of readings written. On failure the unwritten readings
    /// are back in the buffer and the store error is returned.
    pub async fn flush(&self) -> Result<usize, TelemetryStoreError> {
        let batch: Vec<TelemetryReading> = {
            let mut pending = self.lock();
            if pending.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *pending).into()
        };

        let total = batch.len();
        let mut written = 0usize;
        let mut remaining = batch;

        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(MAX_BATCH_SIZE));
            let chunk = std::mem::replace(&mut remaining, rest);
            let chunk_len = chunk.len();

            let batch = match TelemetryBatch::new(chunk) {
                Ok(batch) => batch,
                Err(err) => {
                    // Readings are validated before they are buffered.
                    error!(error = %err, count = chunk_len, "dropping invalid telemetry chunk");
                    self.record_dropped(chunk_len as u64);
                    continue;
                }
            };

            if let Err(err) = self.store.insert_batch(&batch).await {
                let mut unwritten = batch.into_readings();
                unwritten.append(&mut remaining);
                let requeued = unwritten.len();
                self.requeue(unwritten);
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %err,
                    written,
                    requeued,
                    "telemetry flush failed; readings returned to buffer"
                );
                return Err(err);
            }

            written += chunk_len;
            self.counters
                .written
                .fetch_add(chunk_len as u64, Ordering::Relaxed);
        }

        debug!(written, total, "telemetry buffer flushed");
        Ok(written)
    }

    /// Put unwritten readings back in front of anything added meanwhile.
    fn requeue(&self, unwritten: Vec<TelemetryReading>) {
        let dropped = {
            let mut pending = self.lock();
            let newer = std::mem::take(&mut *pending);
            let mut merged: VecDeque<TelemetryReading> = unwritten.into();
            merged.extend(newer);
            let dropped = Self::enforce_capacity(&mut merged, self.config.capacity());
            *pending = merged;
            dropped
        };
        self.record_dropped(dropped);
    }

    fn enforce_capacity(pending: &mut VecDeque<TelemetryReading>, capacity: usize) -> u64 {
        let excess = pending.len().saturating_sub(capacity);
        pending.drain(..excess);
        excess as u64
    }

    fn record_dropped(&self, dropped: u64) {
        if dropped == 0 {
            return;
        }
        let total = self.counters.dropped.fetch_add(dropped, Ordering::Relaxed) + dropped;
        error!(
            dropped,
            total_dropped = total,
            capacity = self.config.capacity(),
            "telemetry buffer full; dropped oldest readings"
        );
    }

    /// Spawn the background flusher: flushes every `flush_interval`, immediately
    /// when `max_size` is reached, and once more when stopped.
    pub fn spawn_flusher(self: &Arc<Self>) -> WorkerHandle {
        let buffer = Arc::clone(self);
        WorkerHandle::spawn("telemetry-flusher", move |mut stop| async move {
            let period = buffer.config.flush_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = ticker.tick() => {}
                    _ = buffer.flush_requested.notified() => {}
                }
                // Errors are logged by `flush`; the readings stay buffered.
                let _ = buffer.flush().await;
            }

            let _ = buffer.flush().await;
        })
    }
}
