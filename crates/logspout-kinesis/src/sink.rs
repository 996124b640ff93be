// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The bulk-write seam between the delivery engine and the stream.
//!
//! A sink receives one batch per call and reports one [`RecordOutcome`] per
//! record, positionally aligned with the input. A call that fails as a whole
//! returns a [`SinkError`] instead; the delivery engine then treats every
//! record of the batch as failed.

use async_trait::async_trait;
use bytes::Bytes;

/// One record as written to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    pub data: Bytes,
    pub partition_key: String,
}

impl SinkRecord {
    /// Size counted against the per-record limit of the stream.
    pub fn size(&self) -> usize {
        self.data.len() + self.partition_key.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Delivered,
    Failed {
        code: Option<String>,
        message: Option<String>,
    },
}

impl RecordOutcome {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        RecordOutcome::Failed {
            code: Some(code.into()),
            message: Some(message.into()),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, RecordOutcome::Delivered)
    }
}

/// Failure of a whole bulk write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Network or service-side failure worth retrying.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// Throttled by the service.
    #[error("sink throttled: {0}")]
    Throttled(String),

    /// Rejected for a reason retrying will not fix (missing stream,
    /// permissions, malformed request).
    #[error("sink rejected the request: {0}")]
    Rejected(String),

    /// The sink answered with something the engine cannot interpret.
    #[error("malformed sink response: {0}")]
    MalformedResponse(String),

    #[error("sink call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SinkError::Transient(_) | SinkError::Throttled(_) | SinkError::Timeout(_)
        )
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Writes `records` in one call. On `Ok`, the returned vector has exactly
    /// one outcome per input record, in input order.
    async fn put_records(&self, records: Vec<SinkRecord>) -> Result<Vec<RecordOutcome>, SinkError>;
}
