// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The adapter facade: one instance per route.
//!
//! ```text
//!   Created --start--> Started --stop / input closed--> Draining --> Stopped
//! ```
//!
//! While started, two background tasks run: the delivery worker
//! ([`BatchScheduler`]) and the [`StatsReporter`]. Ingestion only talks to
//! them through the [`RecordBuffer`].

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::buffer::{PendingRecord, RecordBuffer};
use crate::config::AdapterConfig;
use crate::constants::MAX_RECORD_SIZE_BYTES;
use crate::delivery::DeliveryEngine;
use crate::errors::{AdapterError, AddError, BufferError, ConfigError, IngestError};
use crate::message::RawLogEvent;
use crate::mute::MuteState;
use crate::scheduler::BatchScheduler;
use crate::sink::RecordSink;
use crate::stats::{
    DropReason, LogStatsReceiver, Stats, StatsReceiver, StatsReporter, StatsSnapshot,
};
use crate::transform::transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Configured; no background work yet.
    Created,
    /// Workers running, records accepted.
    Started,
    /// No longer accepting records; the final flush is running.
    Draining,
    Stopped,
}

struct Workers {
    delivery_cancel: CancellationToken,
    delivery: JoinHandle<()>,
    stats_cancel: CancellationToken,
    stats: JoinHandle<()>,
}

pub struct KinesisAdapter {
    config: Arc<AdapterConfig>,
    sink: Arc<dyn RecordSink>,
    stats_receiver: Arc<dyn StatsReceiver>,
    buffer: Arc<RecordBuffer>,
    stats: Arc<Stats>,
    state: RwLock<AdapterState>,
    workers: Mutex<Option<Workers>>,
}

impl KinesisAdapter {
    /// Builds an adapter in the `Created` state. Stats are logged through
    /// [`LogStatsReceiver`] unless replaced with
    /// [`KinesisAdapter::with_stats_receiver`].
    pub fn new(config: AdapterConfig, sink: Arc<dyn RecordSink>) -> Result<Self, ConfigError> {
        config.batch.validate()?;

        let buffer = Arc::new(RecordBuffer::new(
            config.batch.buffer_size,
            config.batch.full_buffer_policy,
            config.batch.batch_size,
        ));
        let stats_receiver: Arc<dyn StatsReceiver> =
            Arc::new(LogStatsReceiver::new(config.stream_name.clone()));

        Ok(Self {
            config: Arc::new(config),
            sink,
            stats_receiver,
            buffer,
            stats: Arc::new(Stats::default()),
            state: RwLock::new(AdapterState::Created),
            workers: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn with_stats_receiver(mut self, receiver: Arc<dyn StatsReceiver>) -> Self {
        self.stats_receiver = receiver;
        self
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub async fn state(&self) -> AdapterState {
        *self.state.read().await
    }

    /// Cumulative counters since construction.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Records queued or in flight.
    pub fn pending(&self) -> usize {
        self.buffer.occupancy()
    }

    /// Spawns the delivery and stats workers.
    pub async fn start(&self) -> Result<(), AdapterError> {
        let mut state = self.state.write().await;
        if *state != AdapterState::Created {
            return Err(AdapterError::InvalidState {
                action: "start",
                state: *state,
            });
        }

        let batch = &self.config.batch;
        let engine = DeliveryEngine::new(
            Arc::clone(&self.sink),
            Arc::clone(&self.buffer),
            Arc::clone(&self.stats),
            batch,
        );
        let scheduler = BatchScheduler::new(
            Arc::clone(&self.buffer),
            engine,
            Arc::clone(&self.stats),
            batch,
        );
        let reporter = StatsReporter::new(
            Arc::clone(&self.stats),
            Arc::clone(&self.buffer),
            Arc::clone(&self.stats_receiver),
            batch.stats_interval,
        );

        let delivery_cancel = CancellationToken::new();
        let stats_cancel = CancellationToken::new();
        let workers = Workers {
            delivery: tokio::spawn(scheduler.run(delivery_cancel.clone())),
            delivery_cancel,
            stats: tokio::spawn(reporter.run(stats_cancel.clone())),
            stats_cancel,
        };
        *self.workers.lock().await = Some(workers);
        *state = AdapterState::Started;

        info!(
            stream = %self.config.stream_name,
            buffer_size = batch.buffer_size,
            batch_size = batch.batch_size,
            "KINESIS | Adapter started"
        );
        Ok(())
    }

    /// Hands one serialized envelope to the buffer.
    ///
    /// Every refused record is counted as dropped with the matching reason.
    pub async fn add(&self, data: impl Into<Bytes>) -> Result<(), AddError> {
        let state = *self.state.read().await;
        let result = match state {
            AdapterState::Created => Err(AddError::NotStarted),
            AdapterState::Draining | AdapterState::Stopped => Err(AddError::Closed),
            AdapterState::Started => self.enqueue(data.into()).await,
        };

        match &result {
            Ok(()) => self.stats.record_accepted(),
            Err(AddError::Oversized { .. }) => self.stats.record_dropped(DropReason::Oversized, 1),
            Err(_) => self.stats.record_dropped(DropReason::Rejected, 1),
        }
        result
    }

    async fn enqueue(&self, data: Bytes) -> Result<(), AddError> {
        let partition_key = self.config.partition_key();
        let size = data.len() + partition_key.len();
        if size > MAX_RECORD_SIZE_BYTES {
            return Err(AddError::Oversized {
                size,
                max: MAX_RECORD_SIZE_BYTES,
            });
        }

        let record = PendingRecord::new(data, partition_key);
        match self.buffer.enqueue(record).await {
            Ok(()) => Ok(()),
            Err(BufferError::Closed) => Err(AddError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Transforms `event` into this adapter's envelope layout and adds it.
    pub async fn add_event(&self, event: &RawLogEvent) -> Result<(), IngestError> {
        let envelope = transform(
            event,
            &self.config.docker_host,
            self.config.envelope_version,
        );
        let data = match envelope.to_json() {
            Ok(data) => data,
            Err(e) => {
                self.stats.record_dropped(DropReason::Serialization, 1);
                return Err(e.into());
            }
        };
        self.add(data).await?;
        Ok(())
    }

    /// Runs the ingestion loop until the host closes `events`, then stops the
    /// adapter. Starts it first when it is still `Created`.
    ///
    /// Failures are logged once and then muted until the next success.
    pub async fn stream(&self, mut events: mpsc::Receiver<RawLogEvent>) -> Result<(), AdapterError> {
        match self.state().await {
            AdapterState::Created => self.start().await?,
            AdapterState::Started => {}
            state => {
                return Err(AdapterError::InvalidState {
                    action: "stream to",
                    state,
                })
            }
        }

        let stream_name = self.config.stream_name.as_str();
        let mut mute = MuteState::new();
        while let Some(event) = events.recv().await {
            match self.add_event(&event).await {
                Ok(()) => mute.success(stream_name),
                Err(e) => mute.failure(stream_name, &e),
            }
        }

        debug!(stream = %stream_name, "KINESIS | Input closed");
        self.stop().await
    }

    /// Stops accepting records, drains the buffer within `drain_timeout` and
    /// joins both workers. Stopping a stopped adapter is a no-op; a stop that
    /// arrives while another one drains returns once that one finished.
    pub async fn stop(&self) -> Result<(), AdapterError> {
        let mut state = self.state.write().await;
        let current = *state;
        match current {
            AdapterState::Stopped => return Ok(()),
            AdapterState::Draining => {
                drop(state);
                // Held by the stop in progress until the workers are joined.
                let _joined = self.workers.lock().await;
                return Ok(());
            }
            AdapterState::Created => {
                self.buffer.close();
                *state = AdapterState::Stopped;
                return Ok(());
            }
            AdapterState::Started => *state = AdapterState::Draining,
        }
        let mut workers = self.workers.lock().await;
        drop(state);

        self.buffer.close();
        let mut result = Ok(());
        if let Some(workers) = workers.take() {
            workers.delivery_cancel.cancel();
            if let Err(e) = workers.delivery.await {
                result = Err(AdapterError::Worker(e.to_string()));
            }
            workers.stats_cancel.cancel();
            if let Err(e) = workers.stats.await {
                result = result.and(Err(AdapterError::Worker(e.to_string())));
            }
        }

        *self.state.write().await = AdapterState::Stopped;
        drop(workers);

        let totals = self.stats.snapshot();
        info!(
            stream = %self.config.stream_name,
            delivered = totals.delivered,
            dropped = totals.dropped.total(),
            "KINESIS | Adapter stopped"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, FullBufferPolicy};
    use crate::sink::{RecordOutcome, SinkError, SinkRecord};
    use crate::transform::EnvelopeVersion;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct CollectingSink {
        records: StdMutex<Vec<SinkRecord>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RecordSink for CollectingSink {
        async fn put_records(
            &self,
            records: Vec<SinkRecord>,
        ) -> Result<Vec<RecordOutcome>, SinkError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let outcomes = vec![RecordOutcome::Delivered; records.len()];
            self.records.lock().unwrap().extend(records);
            Ok(outcomes)
        }
    }

    fn config(batch: BatchConfig) -> AdapterConfig {
        AdapterConfig {
            stream_name: "logs".to_string(),
            docker_host: "host-a".to_string(),
            envelope_version: EnvelopeVersion::V1,
            batch,
        }
    }

    fn adapter(batch: BatchConfig) -> (KinesisAdapter, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let adapter = KinesisAdapter::new(config(batch), sink.clone()).unwrap();
        (adapter, sink)
    }

    fn event(data: &str) -> RawLogEvent {
        serde_json::from_value(serde_json::json!({
            "data": data,
            "time": "2024-03-01T10:15:30Z",
            "source": "stdout",
            "container": {
                "id": "3f4e2a1b9c8d7e6f5a4b3c2d1e0f9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c4d3e2f",
                "name": "/web1",
                "config": {"image": "nginx:1.19", "hostname": "3f4e2a1b9c8d"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let batch = BatchConfig {
            batch_size: 0,
            ..BatchConfig::default()
        };
        let result = KinesisAdapter::new(config(batch), Arc::new(CollectingSink::default()));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_add_before_start() {
        let (adapter, _sink) = adapter(BatchConfig::default());

        assert_eq!(adapter.add(b"x".to_vec()).await, Err(AddError::NotStarted));
        assert_eq!(adapter.stats().dropped.rejected, 1);
        assert_eq!(adapter.state().await, AdapterState::Created);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (adapter, _sink) = adapter(BatchConfig::default());
        adapter.start().await.unwrap();

        assert_eq!(
            adapter.start().await,
            Err(AdapterError::InvalidState {
                action: "start",
                state: AdapterState::Started
            })
        );
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_and_closes() {
        let (adapter, sink) = adapter(BatchConfig::default());
        adapter.start().await.unwrap();
        for n in 0..3 {
            adapter.add(format!("line {n}").into_bytes()).await.unwrap();
        }

        adapter.stop().await.unwrap();
        assert_eq!(adapter.state().await, AdapterState::Stopped);
        assert_eq!(sink.records.lock().unwrap().len(), 3);
        assert_eq!(adapter.stats().delivered, 3);
        assert_eq!(adapter.pending(), 0);

        assert_eq!(adapter.add(b"late".to_vec()).await, Err(AddError::Closed));
        assert!(adapter.stop().await.is_ok());
        assert!(matches!(
            adapter.start().await,
            Err(AdapterError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stop_waits_for_the_drain() {
        let sink = Arc::new(CollectingSink {
            delay: Some(Duration::from_secs(1)),
            ..CollectingSink::default()
        });
        let adapter =
            Arc::new(KinesisAdapter::new(config(BatchConfig::default()), sink.clone()).unwrap());
        adapter.start().await.unwrap();
        for n in 0..3 {
            adapter.add(format!("line {n}").into_bytes()).await.unwrap();
        }

        let first = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.state().await, AdapterState::Draining);

        adapter.stop().await.unwrap();
        assert_eq!(adapter.state().await, AdapterState::Stopped);
        assert_eq!(sink.records.lock().unwrap().len(), 3);

        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (adapter, _sink) = adapter(BatchConfig::default());
        adapter.stop().await.unwrap();
        assert_eq!(adapter.state().await, AdapterState::Stopped);
    }

    #[tokio::test]
    async fn test_reject_policy_drops_when_full() {
        let (adapter, _sink) = adapter(BatchConfig {
            buffer_size: 2,
            batch_size: 2,
            full_buffer_policy: FullBufferPolicy::Reject,
            flush_interval: Duration::from_secs(60),
            ..BatchConfig::default()
        });
        adapter.start().await.unwrap();

        adapter.add(b"a".to_vec()).await.unwrap();
        adapter.add(b"b".to_vec()).await.unwrap();
        let result = adapter.add(b"c".to_vec()).await;
        assert_eq!(
            result,
            Err(AddError::Buffer(BufferError::Full { capacity: 2 }))
        );
        assert_eq!(adapter.stats().dropped.rejected, 1);
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_record_is_dropped() {
        let (adapter, sink) = adapter(BatchConfig::default());
        adapter.start().await.unwrap();

        let result = adapter.add(vec![b'x'; MAX_RECORD_SIZE_BYTES]).await;
        assert_eq!(
            result,
            Err(AddError::Oversized {
                size: MAX_RECORD_SIZE_BYTES + "host-a".len(),
                max: MAX_RECORD_SIZE_BYTES
            })
        );
        adapter.stop().await.unwrap();
        assert_eq!(adapter.stats().dropped.oversized, 1);
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_event_writes_the_envelope() {
        let (adapter, sink) = adapter(BatchConfig::default());
        adapter.start().await.unwrap();
        adapter.add_event(&event("GET /")).await.unwrap();
        adapter.stop().await.unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records[0].partition_key, "host-a");
        let json: serde_json::Value = serde_json::from_slice(&records[0].data).unwrap();
        assert_eq!(json["message"], "GET /");
        assert_eq!(json["docker"]["name"], "web1");
        assert_eq!(json["docker"]["docker_host"], "host-a");
        assert_eq!(
            DateTime::parse_from_rfc3339(json["@timestamp"].as_str().unwrap()).unwrap(),
            DateTime::parse_from_rfc3339("2024-03-01T10:15:30Z").unwrap()
        );
    }

    #[tokio::test]
    async fn test_stream_starts_and_stops() {
        let (adapter, sink) = adapter(BatchConfig::default());
        let (tx, rx) = mpsc::channel(16);
        for n in 0..5 {
            tx.send(event(&format!("line {n}"))).await.unwrap();
        }
        drop(tx);

        adapter.stream(rx).await.unwrap();
        assert_eq!(adapter.state().await, AdapterState::Stopped);
        assert_eq!(sink.records.lock().unwrap().len(), 5);

        let (_tx, rx) = mpsc::channel(1);
        assert!(matches!(
            adapter.stream(rx).await,
            Err(AdapterError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stream_mutes_repeated_failures() {
        let (adapter, _sink) = adapter(BatchConfig {
            buffer_size: 1,
            batch_size: 1,
            flush_interval: Duration::from_secs(60),
            ..BatchConfig::default()
        });
        let adapter = Arc::new(adapter);
        adapter.start().await.unwrap();
        // Every streamed event is refused by the closed buffer.
        adapter.buffer.close();

        let (tx, rx) = mpsc::channel(16);
        for n in 0..4 {
            tx.send(event(&format!("line {n}"))).await.unwrap();
        }
        drop(tx);
        adapter.stream(rx).await.unwrap();

        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("muting until restored"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one failure line, got {n}")),
            }
        });
        assert_eq!(adapter.stats().dropped.rejected, 4);
    }
}
