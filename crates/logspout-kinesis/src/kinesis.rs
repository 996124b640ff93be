// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`RecordSink`] backed by the Kinesis `PutRecords` API, and the matching
//! read side used to check deliveries.

use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_kinesis::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kinesis::operation::put_records::PutRecordsError;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::{PutRecordsRequestEntry, PutRecordsResultEntry, ShardIteratorType};
use bytes::Bytes;
use tracing::debug;

use crate::errors::{ConfigError, ReaderError};
use crate::reader::{ShardPage, ShardSource, StartPosition};
use crate::sink::{RecordOutcome, RecordSink, SinkError, SinkRecord};

/// Writes batches to one Kinesis stream. Region, endpoint and credentials are
/// resolved once in [`KinesisSink::connect`].
#[derive(Debug, Clone)]
pub struct KinesisSink {
    client: aws_sdk_kinesis::Client,
    stream_name: String,
}

impl KinesisSink {
    pub fn new(client: aws_sdk_kinesis::Client, stream_name: impl Into<String>) -> Self {
        Self {
            client,
            stream_name: stream_name.into(),
        }
    }

    /// Builds a client from the standard AWS environment, see
    /// [`load_client`].
    pub async fn connect(
        stream_name: impl Into<String>,
        endpoint_url: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let client = load_client(endpoint_url).await?;
        Ok(Self::new(client, stream_name))
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

/// Loads region, endpoint and credentials from the standard AWS environment.
///
/// Fails when no region is configured or when no credentials can be
/// resolved, so a misconfigured adapter never starts.
pub async fn load_client(endpoint_url: Option<&str>) -> Result<aws_sdk_kinesis::Client, ConfigError> {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(endpoint) = endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    let sdk_config = loader.load().await;

    let Some(region) = sdk_config.region() else {
        return Err(ConfigError::MissingRegion);
    };
    let provider = sdk_config.credentials_provider().ok_or_else(|| {
        ConfigError::Credentials("no credentials provider configured".to_string())
    })?;
    provider
        .provide_credentials()
        .await
        .map_err(|e| ConfigError::Credentials(e.to_string()))?;

    debug!("KINESIS | Loaded client for region {}", region);
    Ok(aws_sdk_kinesis::Client::new(&sdk_config))
}

#[async_trait]
impl RecordSink for KinesisSink {
    async fn put_records(&self, records: Vec<SinkRecord>) -> Result<Vec<RecordOutcome>, SinkError> {
        let expected = records.len();
        let entries = records
            .into_iter()
            .map(|record| {
                PutRecordsRequestEntry::builder()
                    .data(Blob::new(Vec::from(record.data)))
                    .partition_key(record.partition_key)
                    .build()
                    .map_err(|e| SinkError::Rejected(format!("invalid record: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .put_records()
            .stream_name(&self.stream_name)
            .set_records(Some(entries))
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        outcomes_from_entries(output.records(), expected)
    }
}

/// Maps the per-record result entries onto outcomes, checking that the
/// response covers the whole batch.
pub fn outcomes_from_entries(
    entries: &[PutRecordsResultEntry],
    expected: usize,
) -> Result<Vec<RecordOutcome>, SinkError> {
    if entries.len() != expected {
        return Err(SinkError::MalformedResponse(format!(
            "{} result entries for {} records",
            entries.len(),
            expected
        )));
    }
    Ok(entries
        .iter()
        .map(|entry| match entry.error_code() {
            None => RecordOutcome::Delivered,
            Some(code) => RecordOutcome::Failed {
                code: Some(code.to_string()),
                message: entry.error_message().map(str::to_string),
            },
        })
        .collect())
}

/// [`ShardSource`] backed by `ListShards`, `GetShardIterator` and
/// `GetRecords`.
#[derive(Debug, Clone)]
pub struct KinesisShardSource {
    client: aws_sdk_kinesis::Client,
    stream_name: String,
}

impl KinesisShardSource {
    pub fn new(client: aws_sdk_kinesis::Client, stream_name: impl Into<String>) -> Self {
        Self {
            client,
            stream_name: stream_name.into(),
        }
    }
}

#[async_trait]
impl ShardSource for KinesisShardSource {
    async fn shard_ids(&self) -> Result<Vec<String>, ReaderError> {
        let mut shard_ids = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            // The stream name and a continuation token are mutually exclusive.
            let request = match next_token.take() {
                Some(token) => self.client.list_shards().next_token(token),
                None => self.client.list_shards().stream_name(&self.stream_name),
            };
            let output = request
                .send()
                .await
                .map_err(|e| request_error("ListShards", &e))?;

            shard_ids.extend(output.shards().iter().map(|shard| shard.shard_id().to_string()));
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(shard_ids),
            }
        }
    }

    async fn shard_iterator(
        &self,
        shard_id: &str,
        position: StartPosition,
    ) -> Result<String, ReaderError> {
        let iterator_type = match position {
            StartPosition::Latest => ShardIteratorType::Latest,
            StartPosition::TrimHorizon => ShardIteratorType::TrimHorizon,
        };
        let output = self
            .client
            .get_shard_iterator()
            .stream_name(&self.stream_name)
            .shard_id(shard_id)
            .shard_iterator_type(iterator_type)
            .send()
            .await
            .map_err(|e| request_error("GetShardIterator", &e))?;

        output
            .shard_iterator()
            .map(str::to_string)
            .ok_or_else(|| ReaderError::MissingIterator(shard_id.to_string()))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<ShardPage, ReaderError> {
        let output = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(|e| request_error("GetRecords", &e))?;

        Ok(ShardPage {
            records: output
                .records()
                .iter()
                .map(|record| Bytes::copy_from_slice(record.data().as_ref()))
                .collect(),
            next_iterator: output.next_shard_iterator().map(str::to_string),
        })
    }
}

fn request_error<E>(operation: &'static str, err: &E) -> ReaderError
where
    E: std::error::Error,
{
    ReaderError::Request {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

fn classify_sdk_error(err: &SdkError<PutRecordsError>) -> SinkError {
    match err {
        SdkError::ServiceError(service_err) => {
            let inner = service_err.err();
            let message = inner
                .message()
                .map_or_else(|| inner.to_string(), str::to_string);
            classify_error_code(inner.code().unwrap_or("Unknown"), message)
        }
        SdkError::TimeoutError(_) => SinkError::Transient("PutRecords timed out".to_string()),
        SdkError::DispatchFailure(e) => {
            SinkError::Transient(format!("PutRecords dispatch failure: {e:?}"))
        }
        SdkError::ConstructionFailure(e) => {
            SinkError::Rejected(format!("PutRecords construction failure: {e:?}"))
        }
        SdkError::ResponseError(e) => {
            SinkError::MalformedResponse(format!("PutRecords response error: {e:?}"))
        }
        _ => SinkError::Transient(format!("PutRecords failed: {err:?}")),
    }
}

/// Classifies a Kinesis service error code. Unknown codes are treated as
/// transient.
pub fn classify_error_code(code: &str, message: String) -> SinkError {
    match code {
        "ProvisionedThroughputExceededException"
        | "ThrottlingException"
        | "LimitExceededException"
        | "KMSThrottlingException" => SinkError::Throttled(format!("{code}: {message}")),
        "ResourceNotFoundException"
        | "AccessDeniedException"
        | "InvalidArgumentException"
        | "ValidationException"
        | "UnrecognizedClientException"
        | "KMSAccessDeniedException"
        | "KMSDisabledException"
        | "KMSInvalidStateException"
        | "KMSNotFoundException"
        | "KMSOptInRequired" => SinkError::Rejected(format!("{code}: {message}")),
        _ => SinkError::Transient(format!("{code}: {message}")),
    }
}
