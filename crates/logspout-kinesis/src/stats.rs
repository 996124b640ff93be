// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline counters and the periodic stats reporter.
//!
//! Counters are relaxed atomics shared by the ingestion and delivery tasks.
//! The reporter only reads them, along with the buffer gauges, and hands a
//! [`StatsReport`] to a [`StatsReceiver`] on every interval.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::RecordBuffer;
use crate::errors::StatsError;

/// Why a record left the pipeline without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Refused at intake: full buffer under the reject policy, or adapter
    /// not accepting records.
    Rejected,
    /// The envelope could not be serialized.
    Serialization,
    /// The serialized record exceeds the per-record size limit.
    Oversized,
    /// Failed `max_attempts_per_record` delivery attempts.
    MaxAttempts,
    /// Still undelivered when the drain deadline passed.
    Drain,
}

#[derive(Debug, Default)]
pub struct Stats {
    accepted: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    batches: AtomicU64,
    dropped_rejected: AtomicU64,
    dropped_serialization: AtomicU64,
    dropped_oversized: AtomicU64,
    dropped_max_attempts: AtomicU64,
    dropped_drain: AtomicU64,
}

impl Stats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, count: u64) {
        self.delivered.fetch_add(count, Ordering::Relaxed);
    }

    /// Records that failed an attempt and went back to the queue.
    pub fn record_retried(&self, count: u64) {
        self.retried.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, reason: DropReason, count: u64) {
        let counter = match reason {
            DropReason::Rejected => &self.dropped_rejected,
            DropReason::Serialization => &self.dropped_serialization,
            DropReason::Oversized => &self.dropped_oversized,
            DropReason::MaxAttempts => &self.dropped_max_attempts,
            DropReason::Drain => &self.dropped_drain,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            dropped: DropCounts {
                rejected: self.dropped_rejected.load(Ordering::Relaxed),
                serialization: self.dropped_serialization.load(Ordering::Relaxed),
                oversized: self.dropped_oversized.load(Ordering::Relaxed),
                max_attempts: self.dropped_max_attempts.load(Ordering::Relaxed),
                drain: self.dropped_drain.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub rejected: u64,
    pub serialization: u64,
    pub oversized: u64,
    pub max_attempts: u64,
    pub drain: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.rejected + self.serialization + self.oversized + self.max_attempts + self.drain
    }

    fn saturating_sub(&self, earlier: &DropCounts) -> DropCounts {
        DropCounts {
            rejected: self.rejected.saturating_sub(earlier.rejected),
            serialization: self.serialization.saturating_sub(earlier.serialization),
            oversized: self.oversized.saturating_sub(earlier.oversized),
            max_attempts: self.max_attempts.saturating_sub(earlier.max_attempts),
            drain: self.drain.saturating_sub(earlier.drain),
        }
    }
}

/// Plain data copy of [`Stats`], either cumulative or an interval delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub delivered: u64,
    pub retried: u64,
    pub batches: u64,
    pub dropped: DropCounts,
}

impl StatsSnapshot {
    /// Counts accumulated between `earlier` and `self`.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.saturating_sub(earlier.accepted),
            delivered: self.delivered.saturating_sub(earlier.delivered),
            retried: self.retried.saturating_sub(earlier.retried),
            batches: self.batches.saturating_sub(earlier.batches),
            dropped: self.dropped.saturating_sub(&earlier.dropped),
        }
    }
}

/// What the reporter hands to its receiver on every interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReport {
    /// Records waiting in the buffer.
    pub depth: usize,
    pub in_flight: usize,
    /// Records that already failed at least once, queued or in flight.
    pub retrying: usize,
    /// Counts since the previous report.
    pub interval: StatsSnapshot,
    pub totals: StatsSnapshot,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dropped = &self.interval.dropped;
        write!(
            f,
            "depth={}, in_flight={}, retrying={}, delivered={}, dropped={} (rejected={}, serialization={}, oversized={}, max_attempts={}, drain={}), batches={}",
            self.depth,
            self.in_flight,
            self.retrying,
            self.interval.delivered,
            dropped.total(),
            dropped.rejected,
            dropped.serialization,
            dropped.oversized,
            dropped.max_attempts,
            dropped.drain,
            self.interval.batches,
        )
    }
}

#[async_trait]
pub trait StatsReceiver: Send + Sync {
    async fn emit(&self, report: &StatsReport) -> Result<(), StatsError>;
}

/// Writes every report as a structured log line.
#[derive(Debug, Clone)]
pub struct LogStatsReceiver {
    stream_name: String,
}

impl LogStatsReceiver {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
        }
    }
}

#[async_trait]
impl StatsReceiver for LogStatsReceiver {
    async fn emit(&self, report: &StatsReport) -> Result<(), StatsError> {
        info!(
            stream = %self.stream_name,
            depth = report.depth,
            in_flight = report.in_flight,
            retrying = report.retrying,
            delivered = report.interval.delivered,
            dropped = report.interval.dropped.total(),
            "STATS | {report}"
        );
        Ok(())
    }
}

pub struct StatsReporter {
    stats: Arc<Stats>,
    buffer: Arc<RecordBuffer>,
    receiver: Arc<dyn StatsReceiver>,
    interval: Duration,
    previous: StatsSnapshot,
}

impl StatsReporter {
    pub fn new(
        stats: Arc<Stats>,
        buffer: Arc<RecordBuffer>,
        receiver: Arc<dyn StatsReceiver>,
        interval: Duration,
    ) -> Self {
        Self {
            stats,
            buffer,
            receiver,
            interval,
            previous: StatsSnapshot::default(),
        }
    }

    /// Reports on every interval until `cancel` fires, then emits one last
    /// report covering whatever happened since the previous one.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.report().await;
                    debug!("STATS | Reporter stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.report().await;
                }
            }
        }
    }

    /// Builds a report against the previous one and emits it.
    pub async fn report(&mut self) -> StatsReport {
        let totals = self.stats.snapshot();
        let report = StatsReport {
            depth: self.buffer.len(),
            in_flight: self.buffer.in_flight(),
            retrying: self.buffer.retrying(),
            interval: totals.since(&self.previous),
            totals,
        };
        self.previous = totals;

        if let Err(e) = self.receiver.emit(&report).await {
            warn!("STATS | {}", e);
        }
        report
    }
}
