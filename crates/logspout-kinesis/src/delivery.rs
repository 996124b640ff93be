// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of one batch to the sink, with per-record retry.
//!
//! Two retry levels exist. A bulk write that fails as a whole with a
//! retryable [`SinkError`] is repeated up to `transport_retries` times with
//! exponential backoff. Once the write is settled, each record that still
//! failed costs one attempt: it goes back to the front of the buffer while
//! it has attempts left, and is dropped and counted once it reaches
//! `max_attempts_per_record`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer::{PendingRecord, RecordBuffer};
use crate::config::BatchConfig;
use crate::sink::{RecordOutcome, RecordSink, SinkError, SinkRecord};
use crate::stats::{DropReason, Stats};

/// Outcome of [`DeliveryEngine::deliver`] for one batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub delivered: usize,
    /// Failed records put back into the buffer.
    pub retried: usize,
    /// Failed records that ran out of attempts.
    pub dropped: usize,
    /// Set when the whole bulk write failed.
    pub transport_error: Option<SinkError>,
}

pub struct DeliveryEngine {
    sink: Arc<dyn RecordSink>,
    buffer: Arc<RecordBuffer>,
    stats: Arc<Stats>,
    max_attempts: u32,
    sink_timeout: Duration,
    transport_retries: u32,
    retry_backoff: Duration,
}

impl DeliveryEngine {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        buffer: Arc<RecordBuffer>,
        stats: Arc<Stats>,
        config: &BatchConfig,
    ) -> Self {
        Self {
            sink,
            buffer,
            stats,
            max_attempts: config.max_attempts_per_record,
            sink_timeout: config.sink_timeout,
            transport_retries: config.transport_retries,
            retry_backoff: config.retry_backoff,
        }
    }

    /// Sends `batch`, which must have been taken from the buffer with
    /// [`RecordBuffer::dequeue_batch`], and settles every record: released
    /// when delivered or dropped, requeued when it has attempts left.
    pub async fn deliver(&self, batch: Vec<PendingRecord>) -> DeliveryReport {
        if batch.is_empty() {
            return DeliveryReport::default();
        }
        self.stats.record_batch();

        let records: Vec<SinkRecord> = batch.iter().map(PendingRecord::to_sink_record).collect();
        let mut report = DeliveryReport {
            sent: batch.len(),
            ..DeliveryReport::default()
        };

        let outcomes = match self.put_with_retries(records).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(
                    records = batch.len(),
                    "KINESIS | Bulk write failed, counting every record as failed: {}", e
                );
                let failed = RecordOutcome::Failed {
                    code: None,
                    message: Some(e.to_string()),
                };
                report.transport_error = Some(e);
                vec![failed; batch.len()]
            }
        };

        let mut retry = Vec::new();
        let mut settled_retries = 0;
        for (mut record, outcome) in batch.into_iter().zip(outcomes) {
            let was_retry = record.attempts > 0;
            match outcome {
                RecordOutcome::Delivered => {
                    report.delivered += 1;
                    settled_retries += usize::from(was_retry);
                }
                RecordOutcome::Failed { code, message } => {
                    record.attempts += 1;
                    if record.attempts < self.max_attempts {
                        debug!(
                            attempt = record.attempts,
                            "KINESIS | Record failed ({}: {}), will retry",
                            code.as_deref().unwrap_or("unknown"),
                            message.as_deref().unwrap_or("no message")
                        );
                        retry.push(record);
                    } else {
                        warn!(
                            attempts = record.attempts,
                            "KINESIS | Dropping record after {} failed attempts ({}: {})",
                            record.attempts,
                            code.as_deref().unwrap_or("unknown"),
                            message.as_deref().unwrap_or("no message")
                        );
                        report.dropped += 1;
                        settled_retries += usize::from(was_retry);
                    }
                }
            }
        }
        report.retried = retry.len();

        self.buffer.requeue(retry);
        self.buffer
            .release(report.delivered + report.dropped, settled_retries);
        self.stats.record_delivered(report.delivered as u64);
        self.stats.record_retried(report.retried as u64);
        self.stats
            .record_dropped(DropReason::MaxAttempts, report.dropped as u64);

        debug!(
            sent = report.sent,
            delivered = report.delivered,
            retried = report.retried,
            dropped = report.dropped,
            "KINESIS | Batch settled"
        );
        report
    }

    async fn put_with_retries(
        &self,
        records: Vec<SinkRecord>,
    ) -> Result<Vec<RecordOutcome>, SinkError> {
        let expected = records.len();
        let mut retries = 0;
        loop {
            let result =
                match tokio::time::timeout(self.sink_timeout, self.sink.put_records(records.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SinkError::Timeout(self.sink_timeout)),
                };

            match result {
                Ok(outcomes) if outcomes.len() == expected => return Ok(outcomes),
                Ok(outcomes) => {
                    return Err(SinkError::MalformedResponse(format!(
                        "{} outcomes for {} records",
                        outcomes.len(),
                        expected
                    )))
                }
                Err(e) if e.is_retryable() && retries < self.transport_retries => {
                    let backoff = self
                        .retry_backoff
                        .saturating_mul(2_u32.saturating_pow(retries));
                    retries += 1;
                    debug!(
                        attempt = retries,
                        "KINESIS | Bulk write failed ({}), retrying in {} ms",
                        e,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
