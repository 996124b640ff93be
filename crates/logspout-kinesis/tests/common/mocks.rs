// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock sinks and stats receivers for testing

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use logspout_kinesis::errors::StatsError;
use logspout_kinesis::sink::{RecordOutcome, RecordSink, SinkError, SinkRecord};
use logspout_kinesis::stats::{StatsReceiver, StatsReport};

type Response = Result<Vec<RecordOutcome>, SinkError>;
type Poison = Box<dyn Fn(&SinkRecord) -> bool + Send + Sync>;

/// Sink that replays scripted responses, then delivers every record not
/// matched by its poison predicate.
#[derive(Default)]
pub struct MockSink {
    scripted: Mutex<VecDeque<Response>>,
    poison: Option<Poison>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<SinkRecord>>>,
    delivered: Mutex<Vec<SinkRecord>>,
}

#[allow(dead_code)]
impl MockSink {
    pub fn delivering() -> Self {
        Self::default()
    }

    pub fn scripted(responses: Vec<Response>) -> Self {
        Self {
            scripted: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// Fails every record matching `poison`, on every attempt.
    pub fn failing_records<F>(poison: F) -> Self
    where
        F: Fn(&SinkRecord) -> bool + Send + Sync + 'static,
    {
        Self {
            poison: Some(Box::new(poison)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Size of every batch received, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn delivered(&self) -> Vec<SinkRecord> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_json(&self) -> Vec<serde_json::Value> {
        self.delivered()
            .iter()
            .map(|record| serde_json::from_slice(&record.data).expect("record is JSON"))
            .collect()
    }
}

#[async_trait]
impl RecordSink for MockSink {
    async fn put_records(&self, records: Vec<SinkRecord>) -> Response {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push(records.clone());

        let response = self.scripted.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(records
                .iter()
                .map(|record| match &self.poison {
                    Some(poison) if poison(record) => RecordOutcome::failed(
                        "InternalFailure",
                        "Internal service failure.",
                    ),
                    _ => RecordOutcome::Delivered,
                })
                .collect())
        });

        if let Ok(outcomes) = &response {
            let mut delivered = self.delivered.lock().unwrap();
            for (record, outcome) in records.iter().zip(outcomes) {
                if outcome.is_delivered() {
                    delivered.push(record.clone());
                }
            }
        }
        response
    }
}

/// Stats receiver that keeps every report.
#[derive(Default)]
pub struct MockStatsReceiver {
    reports: Mutex<Vec<StatsReport>>,
}

#[allow(dead_code)]
impl MockStatsReceiver {
    pub fn reports(&self) -> Vec<StatsReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatsReceiver for MockStatsReceiver {
    async fn emit(&self, report: &StatsReport) -> Result<(), StatsError> {
        self.reports.lock().unwrap().push(*report);
        Ok(())
    }
}
