// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Default number of records the buffer holds, queued and in flight.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Default number of records per `PutRecords` call.
pub const DEFAULT_BATCH_SIZE: usize = 10;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of delivery attempts before a record is dropped.
pub const DEFAULT_MAX_ATTEMPTS_PER_RECORD: u32 = 10;

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Caller-side timeout applied to every bulk write.
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Bulk-write retries on transport errors, distinct from per-record attempts.
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 3;

/// Base delay of the transport retry backoff; doubles on every retry.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound for the final flush performed while stopping.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_DOCKER_HOST: &str = "unknown-docker-host";

/// Maximum number of records accepted by a single `PutRecords` call.
pub const MAX_BATCH_SIZE: usize = 500;

/// Maximum size of a single Kinesis record, data blob plus partition key.
pub const MAX_RECORD_SIZE_BYTES: usize = 1024 * 1024;

/// Maximum length of a Kinesis partition key, in Unicode characters.
pub const MAX_PARTITION_KEY_LENGTH: usize = 256;

/// Number of characters kept from the full container id.
pub const SHORT_CONTAINER_ID_LENGTH: usize = 12;

/// Records requested per `GetRecords` call when reading a stream back.
pub const GET_RECORDS_LIMIT: i32 = 500;

/// Kinesis allows five reads per second per shard; reads of all shards share
/// this interval.
pub const SHARD_READ_INTERVAL: Duration = Duration::from_millis(200);
