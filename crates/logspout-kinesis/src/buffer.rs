// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded queue between the ingestion path and the delivery worker.
//!
//! Occupancy is `queued + in_flight`: a record handed out by
//! [`RecordBuffer::dequeue_batch`] keeps its slot until the delivery engine
//! either releases it (delivered or dropped) or puts it back at the front of
//! the queue with [`RecordBuffer::requeue`]. Requeued records reuse the slot
//! they already hold, so a retry can never be refused for lack of space and
//! the single delivery worker never waits on producers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::config::FullBufferPolicy;
use crate::errors::BufferError;
use crate::sink::SinkRecord;

/// A serialized envelope waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub data: Bytes,
    pub partition_key: String,
    /// Failed delivery attempts so far.
    pub attempts: u32,
}

impl PendingRecord {
    pub fn new(data: impl Into<Bytes>, partition_key: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            partition_key: partition_key.into(),
            attempts: 0,
        }
    }

    pub fn to_sink_record(&self) -> SinkRecord {
        SinkRecord {
            data: self.data.clone(),
            partition_key: self.partition_key.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    queue: VecDeque<PendingRecord>,
    in_flight: usize,
    /// Records that already failed at least once, split by where they are.
    retry_queued: usize,
    retry_in_flight: usize,
    closed: bool,
}

impl BufferState {
    fn occupancy(&self) -> usize {
        self.queue.len() + self.in_flight
    }
}

#[derive(Debug)]
pub struct RecordBuffer {
    capacity: usize,
    policy: FullBufferPolicy,
    batch_threshold: usize,
    state: Mutex<BufferState>,
    space_available: Notify,
    batch_ready: Notify,
    // Mirrors of the locked state, read by the stats task without locking.
    queued_gauge: AtomicUsize,
    in_flight_gauge: AtomicUsize,
    retrying_gauge: AtomicUsize,
}

impl RecordBuffer {
    /// `batch_threshold` is the queue length at which the delivery worker is
    /// woken up to cut a batch.
    pub fn new(capacity: usize, policy: FullBufferPolicy, batch_threshold: usize) -> Self {
        Self {
            capacity,
            policy,
            batch_threshold: batch_threshold.max(1),
            state: Mutex::new(BufferState::default()),
            space_available: Notify::new(),
            batch_ready: Notify::new(),
            queued_gauge: AtomicUsize::new(0),
            in_flight_gauge: AtomicUsize::new(0),
            retrying_gauge: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> FullBufferPolicy {
        self.policy
    }

    /// Adds a record according to the configured full-buffer policy.
    pub async fn enqueue(&self, record: PendingRecord) -> Result<(), BufferError> {
        match self.policy {
            FullBufferPolicy::Reject => self.try_enqueue(record),
            FullBufferPolicy::Block => self.enqueue_blocking(record).await,
        }
    }

    /// Adds a record if a slot is free. A full buffer is left untouched.
    pub fn try_enqueue(&self, record: PendingRecord) -> Result<(), BufferError> {
        self.push(record).map_err(|(error, _)| error)
    }

    async fn enqueue_blocking(&self, mut record: PendingRecord) -> Result<(), BufferError> {
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await is not missed.
            notified.as_mut().enable();

            match self.push(record) {
                Ok(()) => return Ok(()),
                Err((BufferError::Closed, _)) => return Err(BufferError::Closed),
                Err((BufferError::Full { .. }, returned)) => record = returned,
            }
            notified.await;
        }
    }

    fn push(&self, record: PendingRecord) -> Result<(), (BufferError, PendingRecord)> {
        let mut state = self.lock();
        if state.closed {
            return Err((BufferError::Closed, record));
        }
        if state.occupancy() >= self.capacity {
            return Err((
                BufferError::Full {
                    capacity: self.capacity,
                },
                record,
            ));
        }
        if record.attempts > 0 {
            state.retry_queued += 1;
        }
        state.queue.push_back(record);
        self.publish(&state);
        if state.queue.len() >= self.batch_threshold {
            self.batch_ready.notify_one();
        }
        Ok(())
    }

    /// Takes up to `max` records from the front of the queue without waiting.
    /// The records stay counted as in flight until they are released or
    /// requeued.
    pub fn dequeue_batch(&self, max: usize) -> Vec<PendingRecord> {
        let mut state = self.lock();
        let count = max.min(state.queue.len());
        let batch: Vec<PendingRecord> = state.queue.drain(..count).collect();
        let retried = batch.iter().filter(|record| record.attempts > 0).count();
        state.retry_queued -= retried;
        state.retry_in_flight += retried;
        state.in_flight += batch.len();
        self.publish(&state);
        batch
    }

    /// Puts in-flight records back at the front of the queue, keeping their
    /// order. They reuse their slot, so this never fails for lack of space.
    ///
    /// Each record's `attempts` must already count the failure that sent it
    /// back.
    pub fn requeue(&self, records: Vec<PendingRecord>) {
        if records.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(records.len());
        let was_retrying = records.iter().filter(|record| record.attempts > 1).count();
        state.retry_in_flight = state.retry_in_flight.saturating_sub(was_retrying);
        for record in records.into_iter().rev() {
            if record.attempts > 0 {
                state.retry_queued += 1;
            }
            state.queue.push_front(record);
        }
        self.publish(&state);
        if state.queue.len() >= self.batch_threshold {
            self.batch_ready.notify_one();
        }
    }

    /// Frees the slots of `count` in-flight records that were delivered or
    /// dropped, `retries` of which had already failed when dequeued.
    pub fn release(&self, count: usize, retries: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(count);
        state.retry_in_flight = state.retry_in_flight.saturating_sub(retries);
        self.publish(&state);
        drop(state);
        self.space_available.notify_waiters();
    }

    /// Refuses further records and wakes every blocked producer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.space_available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Empties the buffer, queued and in-flight alike, and returns how many
    /// records were discarded.
    pub fn drain_all(&self) -> usize {
        let mut state = self.lock();
        let discarded = state.occupancy();
        state.queue.clear();
        state.in_flight = 0;
        state.retry_queued = 0;
        state.retry_in_flight = 0;
        self.publish(&state);
        drop(state);
        self.space_available.notify_waiters();
        discarded
    }

    /// Resolves once the queue reached the batch threshold since the last
    /// wake-up. Callers re-check [`RecordBuffer::len`] afterwards.
    pub async fn batch_ready(&self) {
        self.batch_ready.notified().await;
    }

    /// Records waiting in the queue.
    pub fn len(&self) -> usize {
        self.queued_gauge.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight_gauge.load(Ordering::Relaxed)
    }

    /// Queued plus in flight; never above [`RecordBuffer::capacity`].
    pub fn occupancy(&self) -> usize {
        self.len() + self.in_flight()
    }

    /// Records that already failed at least once, queued or in flight.
    pub fn retrying(&self) -> usize {
        self.retrying_gauge.load(Ordering::Relaxed)
    }

    fn publish(&self, state: &BufferState) {
        self.queued_gauge.store(state.queue.len(), Ordering::Relaxed);
        self.in_flight_gauge.store(state.in_flight, Ordering::Relaxed);
        self.retrying_gauge
            .store(state.retry_queued + state.retry_in_flight, Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
