// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The delivery worker loop.
//!
//! A batch is cut as soon as `batch_size` records are queued, or when
//! `flush_interval` passed since the last cut, whichever comes first. The
//! interval timer restarts after every cut. On cancellation the worker
//! flushes what is left, the write in progress included, under a single
//! `drain_timeout` deadline counted from the cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::RecordBuffer;
use crate::config::BatchConfig;
use crate::delivery::{DeliveryEngine, DeliveryReport};
use crate::stats::{DropReason, Stats};

pub struct BatchScheduler {
    buffer: Arc<RecordBuffer>,
    engine: DeliveryEngine,
    stats: Arc<Stats>,
    batch_size: usize,
    flush_interval: Duration,
    drain_timeout: Duration,
}

impl BatchScheduler {
    pub fn new(
        buffer: Arc<RecordBuffer>,
        engine: DeliveryEngine,
        stats: Arc<Stats>,
        config: &BatchConfig,
    ) -> Self {
        Self {
            buffer,
            engine,
            stats,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            drain_timeout: config.drain_timeout,
        }
    }

    /// Cuts and delivers batches until `cancel` fires, then drains.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Set when a whole batch failed; size-triggered cuts then wait for the
        // next tick instead of hammering the sink.
        let mut stalled = false;

        let deadline = 'deliver: loop {
            if !stalled {
                while self.buffer.len() >= self.batch_size {
                    let report = match self.cut_until_cancelled(&cancel).await {
                        Ok(report) => report,
                        Err(deadline) => break 'deliver deadline,
                    };
                    ticker.reset();
                    if Self::made_no_progress(&report) {
                        stalled = true;
                        break;
                    }
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break 'deliver Instant::now() + self.drain_timeout,
                () = self.buffer.batch_ready(), if !stalled => {}
                _ = ticker.tick() => {
                    let report = match self.cut_until_cancelled(&cancel).await {
                        Ok(report) => report,
                        Err(deadline) => break 'deliver deadline,
                    };
                    ticker.reset();
                    stalled = Self::made_no_progress(&report);
                }
            }
        };

        self.drain(deadline).await;
    }

    async fn cut(&self) -> DeliveryReport {
        let batch = self.buffer.dequeue_batch(self.batch_size);
        self.engine.deliver(batch).await
    }

    /// Delivers one batch. When `cancel` fires first, the write in progress
    /// becomes part of the drain: it may finish until the drain deadline,
    /// which is returned as the error. Past the deadline its records stay in
    /// flight until the drain discards them.
    async fn cut_until_cancelled(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReport, Instant> {
        let cut = self.cut();
        tokio::pin!(cut);
        tokio::select! {
            biased;
            report = &mut cut => Ok(report),
            () = cancel.cancelled() => {
                let deadline = Instant::now() + self.drain_timeout;
                // The outcome is settled in the buffer either way.
                let _ = tokio::time::timeout_at(deadline, cut).await;
                Err(deadline)
            }
        }
    }

    fn made_no_progress(report: &DeliveryReport) -> bool {
        report.sent > 0 && report.delivered == 0
    }

    /// Final forced flush. Whatever is still undelivered at `deadline`,
    /// including a write cut short by it, is dropped and counted.
    async fn drain(&self, deadline: Instant) {
        let pending = self.buffer.occupancy();
        if pending == 0 {
            debug!("KINESIS | Nothing to drain");
            return;
        }
        info!(records = pending, "KINESIS | Draining buffered records");

        let flush = async {
            while !self.buffer.is_empty() {
                self.cut().await;
            }
        };
        let timed_out = tokio::time::timeout_at(deadline, flush).await.is_err();

        let discarded = self.buffer.drain_all();
        if discarded == 0 {
            return;
        }
        self.stats
            .record_dropped(DropReason::Drain, discarded as u64);
        if timed_out {
            warn!(
                dropped = discarded,
                "KINESIS | Drain timed out after {} ms, dropped {} records",
                self.drain_timeout.as_millis(),
                discarded
            );
        } else {
            warn!(
                dropped = discarded,
                "KINESIS | Dropped {} records whose write was cut short",
                discarded
            );
        }
    }
}
