// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use logspout_kinesis::config::{AdapterConfig, BatchConfig};
use logspout_kinesis::message::{Container, ContainerConfig, RawLogEvent};
use logspout_kinesis::transform::EnvelopeVersion;

pub const CONTAINER_ID: &str = "3f4e2a1b9c8d7e6f5a4b3c2d1e0f9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c4d3e2f";

/// A `stdout` line from the `/web1` nginx container.
pub fn web1_event(data: &str) -> RawLogEvent {
    RawLogEvent {
        data: data.to_string(),
        time: DateTime::parse_from_rfc3339("2024-03-01T10:15:30.123456789Z")
            .expect("valid timestamp"),
        source: "stdout".to_string(),
        container: Container {
            id: CONTAINER_ID.to_string(),
            name: "/web1".to_string(),
            config: ContainerConfig {
                image: "nginx:1.19".to_string(),
                hostname: "3f4e2a1b9c8d".to_string(),
                labels: BTreeMap::new(),
            },
        },
    }
}

/// Small, fast settings suited to paused-clock tests.
pub fn test_batch_config() -> BatchConfig {
    BatchConfig {
        buffer_size: 100,
        batch_size: 10,
        flush_interval: Duration::from_secs(1),
        max_attempts_per_record: 3,
        stats_interval: Duration::from_secs(1),
        retry_backoff: Duration::from_millis(10),
        ..BatchConfig::default()
    }
}

pub fn adapter_config(version: EnvelopeVersion, batch: BatchConfig) -> AdapterConfig {
    AdapterConfig {
        stream_name: "logbuffer-test".to_string(),
        docker_host: "host-a".to_string(),
        envelope_version: version,
        batch,
    }
}
