// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::adapter::AdapterState;

/// Errors raised while building an adapter. These are fatal: the adapter
/// refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for option {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid route {route:?}: {reason}")]
    InvalidRoute { route: String, reason: String },

    #[error("unable to resolve AWS credentials: {0}")]
    Credentials(String),

    #[error("no AWS region configured, set AWS_REGION")]
    MissingRegion,
}

/// Errors returned by [`crate::buffer::RecordBuffer::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("buffer is full ({capacity} records)")]
    Full { capacity: usize },

    #[error("buffer is closed")]
    Closed,
}

/// Errors returned when handing a record to a running adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddError {
    #[error("adapter has not been started")]
    NotStarted,

    #[error("adapter is closed")]
    Closed,

    #[error("record of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Errors on the per-record ingestion path, from host event to `add`.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Add(#[from] AddError),
}

/// Lifecycle errors of the adapter facade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("cannot {action} adapter in state {state:?}")]
    InvalidState {
        action: &'static str,
        state: AdapterState,
    },

    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Failure of a stats receiver. Logged by the reporter, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("failed to emit stats: {0}")]
    Emit(String),
}

/// Errors while reading a stream back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReaderError {
    #[error("stream {0} has no shards")]
    NoShards(String),

    #[error("no shard iterator returned for shard {0}")]
    MissingIterator(String),

    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },
}
