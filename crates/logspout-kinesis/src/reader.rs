// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads every shard of a stream in turn and hands each record to a
//! callback, for checking what the adapter delivered.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::{GET_RECORDS_LIMIT, SHARD_READ_INTERVAL};
use crate::errors::ReaderError;

/// Where a freshly opened shard iterator starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Only records written after the iterator was opened.
    #[default]
    Latest,
    /// The oldest record still retained.
    TrimHorizon,
}

/// One `GetRecords` page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardPage {
    pub records: Vec<Bytes>,
    /// `None` once the shard is closed and fully read.
    pub next_iterator: Option<String>,
}

/// Read side of a stream.
#[async_trait]
pub trait ShardSource: Send + Sync {
    async fn shard_ids(&self) -> Result<Vec<String>, ReaderError>;

    async fn shard_iterator(
        &self,
        shard_id: &str,
        position: StartPosition,
    ) -> Result<String, ReaderError>;

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<ShardPage, ReaderError>;
}

pub struct StreamTail<S> {
    source: S,
    stream_name: String,
    position: StartPosition,
    read_interval: Duration,
}

impl<S: ShardSource> StreamTail<S> {
    pub fn new(source: S, stream_name: impl Into<String>, position: StartPosition) -> Self {
        Self {
            source,
            stream_name: stream_name.into(),
            position,
            read_interval: SHARD_READ_INTERVAL,
        }
    }

    /// Polls the shards round-robin until `cancel` fires or every shard is
    /// closed. Returns the number of records handed to `on_record`.
    pub async fn run<F>(&self, cancel: CancellationToken, mut on_record: F) -> Result<u64, ReaderError>
    where
        F: FnMut(Bytes) + Send,
    {
        let shard_ids = self.source.shard_ids().await?;
        if shard_ids.is_empty() {
            return Err(ReaderError::NoShards(self.stream_name.clone()));
        }

        let mut iterators = VecDeque::with_capacity(shard_ids.len());
        for shard_id in &shard_ids {
            let iterator = self.source.shard_iterator(shard_id, self.position).await?;
            iterators.push_back(iterator);
        }
        debug!(
            shards = shard_ids.len(),
            "KINESIS | Reading stream {}", self.stream_name
        );

        // Spread the per-shard read budget over all shards.
        let divisor = u32::try_from(shard_ids.len()).unwrap_or(u32::MAX);
        let pause = self.read_interval / divisor;

        let mut received = 0;
        while let Some(iterator) = iterators.pop_front() {
            let page = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                page = self.source.get_records(&iterator, GET_RECORDS_LIMIT) => page?,
            };

            for record in page.records {
                received += 1;
                on_record(record);
            }
            match page.next_iterator {
                Some(next) => iterators.push_back(next),
                None => debug!("KINESIS | Shard closed"),
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }
        Ok(received)
    }
}
