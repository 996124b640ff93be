// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::helpers::{adapter_config, test_batch_config, web1_event};
use common::mocks::{MockSink, MockStatsReceiver};
use logspout_kinesis::adapter::{AdapterState, KinesisAdapter};
use logspout_kinesis::config::{BatchConfig, FullBufferPolicy};
use logspout_kinesis::errors::AddError;
use logspout_kinesis::sink::{RecordOutcome, SinkError};
use logspout_kinesis::transform::EnvelopeVersion;
use tokio::sync::mpsc;

fn build(version: EnvelopeVersion, batch: BatchConfig, sink: &Arc<MockSink>) -> Arc<KinesisAdapter> {
    let adapter = KinesisAdapter::new(adapter_config(version, batch), sink.clone())
        .expect("valid configuration");
    Arc::new(adapter)
}

#[tokio::test(start_paused = true)]
async fn test_web1_event_end_to_end() {
    let sink = Arc::new(MockSink::delivering());
    let adapter = build(EnvelopeVersion::V1, test_batch_config(), &sink);

    let (tx, rx) = mpsc::channel(1000);
    tx.send(web1_event("GET /")).await.unwrap();
    drop(tx);
    adapter.stream(rx).await.unwrap();

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].partition_key, "host-a");

    let json = &sink.delivered_json()[0];
    assert_eq!(json["message"], "GET /");
    assert_eq!(json["host"], "3f4e2a1b9c8d");
    assert_eq!(json["@timestamp"], "2024-03-01T10:15:30.123456789Z");
    assert_eq!(json["docker"]["name"], "web1");
    assert_eq!(json["docker"]["cid"], "3f4e2a1b9c8d");
    assert_eq!(json["docker"]["image"], "nginx");
    assert_eq!(json["docker"]["image_tag"], "1.19");
    assert_eq!(json["docker"]["source"], "stdout");
    assert_eq!(json["docker"]["docker_host"], "host-a");
    assert!(json["docker"].get("labels").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_v0_layout_end_to_end() {
    let sink = Arc::new(MockSink::delivering());
    let adapter = build(EnvelopeVersion::V0, test_batch_config(), &sink);

    let (tx, rx) = mpsc::channel(1000);
    tx.send(web1_event("GET /healthz")).await.unwrap();
    drop(tx);
    adapter.stream(rx).await.unwrap();

    let json = &sink.delivered_json()[0];
    assert_eq!(json["@message"], "GET /healthz");
    assert_eq!(json["@source_host"], "3f4e2a1b9c8d");
    assert_eq!(json["@fields"]["docker"]["name"], "web1");
    assert_eq!(json["@fields"]["docker"]["image_tag"], "1.19");
    assert!(json.get("docker").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_batches_respect_size_and_interval() {
    let sink = Arc::new(MockSink::delivering());
    let adapter = build(EnvelopeVersion::V1, test_batch_config(), &sink);
    adapter.start().await.unwrap();

    for n in 0..25 {
        adapter.add_event(&web1_event(&format!("line {n}"))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.batch_sizes(), vec![10, 10]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.batch_sizes(), vec![10, 10, 5]);

    adapter.stop().await.unwrap();
    assert_eq!(adapter.stats().delivered, 25);
}

#[tokio::test(start_paused = true)]
async fn test_poisoned_record_is_dropped_after_max_attempts() {
    let sink = Arc::new(MockSink::failing_records(|record| {
        record.data.windows(6).any(|w| w == b"poison")
    }));
    let adapter = build(EnvelopeVersion::V1, test_batch_config(), &sink);
    adapter.start().await.unwrap();

    adapter.add_event(&web1_event("fine")).await.unwrap();
    adapter.add_event(&web1_event("poison")).await.unwrap();
    adapter.add_event(&web1_event("also fine")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let stats = adapter.stats();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.dropped.max_attempts, 1);
    assert_eq!(stats.retried, 2);
    assert_eq!(adapter.pending(), 0);

    // One batch with all three, then the poisoned record alone twice more.
    assert_eq!(sink.batch_sizes(), vec![3, 1, 1]);
    adapter.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_is_retried_until_delivered() {
    let sink = Arc::new(MockSink::scripted(vec![
        Err(SinkError::Transient("connection reset by peer".to_string())),
        Ok(vec![
            RecordOutcome::Delivered,
            RecordOutcome::failed(
                "ProvisionedThroughputExceededException",
                "Rate exceeded for shard shardId-000000000001",
            ),
        ]),
    ]));
    let adapter = build(EnvelopeVersion::V1, test_batch_config(), &sink);
    adapter.start().await.unwrap();

    adapter.add_event(&web1_event("first")).await.unwrap();
    adapter.add_event(&web1_event("second")).await.unwrap();
    adapter.stop().await.unwrap();

    let messages: Vec<_> = sink
        .delivered_json()
        .iter()
        .map(|json| json["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(messages, vec!["first", "second"]);
    assert_eq!(adapter.stats().dropped.total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_block_policy_applies_backpressure() {
    let sink = Arc::new(MockSink::delivering().with_delay(Duration::from_millis(500)));
    let batch = BatchConfig {
        buffer_size: 4,
        batch_size: 2,
        full_buffer_policy: FullBufferPolicy::Block,
        ..test_batch_config()
    };
    let adapter = build(EnvelopeVersion::V1, batch, &sink);
    adapter.start().await.unwrap();

    let producer = {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move {
            for n in 0..20 {
                adapter
                    .add_event(&web1_event(&format!("line {n}")))
                    .await
                    .unwrap();
                assert!(adapter.pending() <= 4);
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!producer.is_finished());
    assert!(adapter.pending() <= 4);

    producer.await.unwrap();
    adapter.stop().await.unwrap();

    let stats = adapter.stats();
    assert_eq!(stats.accepted, 20);
    assert_eq!(stats.delivered, 20);
    assert_eq!(stats.dropped.total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reject_policy_counts_refused_records() {
    let sink = Arc::new(MockSink::delivering().with_delay(Duration::from_secs(2)));
    let batch = BatchConfig {
        buffer_size: 4,
        batch_size: 2,
        full_buffer_policy: FullBufferPolicy::Reject,
        ..test_batch_config()
    };
    let adapter = build(EnvelopeVersion::V1, batch, &sink);
    adapter.start().await.unwrap();

    let mut refused = 0;
    for n in 0..10 {
        match adapter.add_event(&web1_event(&format!("line {n}"))).await {
            Ok(()) => {}
            Err(_) => refused += 1,
        }
    }
    assert_eq!(refused, 6);

    adapter.stop().await.unwrap();
    let stats = adapter.stats();
    assert_eq!(stats.accepted, 4);
    assert_eq!(stats.delivered, 4);
    assert_eq!(stats.dropped.rejected, 6);
}

#[tokio::test(start_paused = true)]
async fn test_every_record_is_accounted_for_after_drain_timeout() {
    let sink = Arc::new(MockSink::failing_records(|_| true).with_delay(Duration::from_secs(1)));
    let batch = BatchConfig {
        max_attempts_per_record: 100,
        drain_timeout: Duration::from_secs(3),
        ..test_batch_config()
    };
    let adapter = build(EnvelopeVersion::V1, batch, &sink);
    adapter.start().await.unwrap();

    for n in 0..15 {
        adapter.add_event(&web1_event(&format!("line {n}"))).await.unwrap();
    }
    adapter.stop().await.unwrap();

    let stats = adapter.stats();
    assert_eq!(adapter.state().await, AdapterState::Stopped);
    assert_eq!(stats.accepted, 15);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.dropped.drain, 15);
    assert_eq!(adapter.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_with_a_hung_sink_takes_at_most_the_drain_timeout() {
    let sink = Arc::new(MockSink::delivering().with_delay(Duration::from_secs(3600)));
    let batch = BatchConfig {
        drain_timeout: Duration::from_secs(1),
        ..test_batch_config()
    };
    let adapter = build(EnvelopeVersion::V1, batch, &sink);
    adapter.start().await.unwrap();

    for n in 0..12 {
        adapter.add_event(&web1_event(&format!("line {n}"))).await.unwrap();
    }
    // The first ten are being sent; the other two wait in the queue.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(adapter.pending(), 12);
    assert!(sink.batch_sizes().is_empty());

    let started = tokio::time::Instant::now();
    adapter.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1100));

    let stats = adapter.stats();
    assert_eq!(stats.accepted, 12);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.dropped.drain, 12);
    assert_eq!(adapter.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stats_receiver_sees_deliveries() {
    let sink = Arc::new(MockSink::delivering());
    let receiver = Arc::new(MockStatsReceiver::default());
    let adapter = KinesisAdapter::new(
        adapter_config(EnvelopeVersion::V1, test_batch_config()),
        sink.clone(),
    )
    .unwrap()
    .with_stats_receiver(receiver.clone());
    adapter.start().await.unwrap();

    for n in 0..12 {
        adapter.add_event(&web1_event(&format!("line {n}"))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(2500)).await;
    adapter.stop().await.unwrap();

    let reports = receiver.reports();
    assert!(reports.len() >= 3);
    let delivered: u64 = reports.iter().map(|r| r.interval.delivered).sum();
    assert_eq!(delivered, 12);
    assert_eq!(reports.last().unwrap().totals.delivered, 12);
}

#[tokio::test]
async fn test_add_after_stop_is_refused() {
    let sink = Arc::new(MockSink::delivering());
    let adapter = build(EnvelopeVersion::V1, test_batch_config(), &sink);
    adapter.start().await.unwrap();
    adapter.stop().await.unwrap();

    assert_eq!(adapter.add(b"{}".to_vec()).await, Err(AddError::Closed));
}
