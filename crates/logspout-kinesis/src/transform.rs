// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mapping of raw log events into the Logstash-style JSON envelopes written to
//! the stream.
//!
//! Two layouts exist and an adapter uses exactly one of them for its whole
//! lifetime:
//!
//! ```json
//! // V0
//! {"@timestamp": "...", "@source_host": "...", "@message": "...",
//!  "@fields": {"docker": {"name": "web1", "cid": "3f4e2a1b9c8d", ...}}}
//!
//! // V1
//! {"@timestamp": "...", "host": "...", "message": "...",
//!  "docker": {"name": "web1", "cid": "3f4e2a1b9c8d", ...}}
//! ```
//!
//! `image_tag`, `docker_host` and `labels` are left out of the output when
//! they are empty.

use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::SHORT_CONTAINER_ID_LENGTH;
use crate::message::RawLogEvent;

/// Envelope layout, resolved once when the adapter is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvelopeVersion {
    /// Legacy Logstash layout with `@`-prefixed keys and nested `@fields`.
    V0,
    #[default]
    V1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerFields {
    pub name: String,
    pub cid: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_tag: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogstashFields {
    pub docker: DockerFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeV0 {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    #[serde(rename = "@source_host")]
    pub source_host: String,
    #[serde(rename = "@message")]
    pub message: String,
    #[serde(rename = "@fields")]
    pub fields: LogstashFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeV1 {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub host: String,
    pub message: String,
    pub docker: DockerFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    V0(EnvelopeV0),
    V1(EnvelopeV1),
}

impl Envelope {
    pub fn docker(&self) -> &DockerFields {
        match self {
            Envelope::V0(envelope) => &envelope.fields.docker,
            Envelope::V1(envelope) => &envelope.docker,
        }
    }

    /// Encodes the envelope as the UTF-8 JSON bytes written to the stream.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Builds the envelope for `event`. Pure: the same input always yields the
/// same envelope.
pub fn transform(event: &RawLogEvent, docker_host: &str, version: EnvelopeVersion) -> Envelope {
    let (image, image_tag) = split_image(&event.container.config.image);
    let labels = &event.container.config.labels;

    let docker = DockerFields {
        name: container_name(&event.container.name).to_string(),
        cid: short_container_id(&event.container.id).to_string(),
        image: image.to_string(),
        image_tag: image_tag.to_string(),
        source: event.source.clone(),
        docker_host: (!docker_host.is_empty()).then(|| docker_host.to_string()),
        labels: (!labels.is_empty()).then(|| labels.clone()),
    };
    let timestamp = format_timestamp(&event.time);
    let host = event.container.config.hostname.clone();
    let message = event.data.clone();

    match version {
        EnvelopeVersion::V0 => Envelope::V0(EnvelopeV0 {
            timestamp,
            source_host: host,
            message,
            fields: LogstashFields { docker },
        }),
        EnvelopeVersion::V1 => Envelope::V1(EnvelopeV1 {
            timestamp,
            host,
            message,
            docker,
        }),
    }
}

/// Splits `repository:tag` at the first `:`. A reference without a tag yields
/// an empty tag.
pub fn split_image(image: &str) -> (&str, &str) {
    match image.split_once(':') {
        Some((name, tag)) => (name, tag),
        None => (image, ""),
    }
}

/// First 12 characters of the container id, or an empty string when the id
/// is too short to be a real one.
pub fn short_container_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .map(|(index, _)| index)
        .chain(std::iter::once(id.len()))
        .nth(SHORT_CONTAINER_ID_LENGTH);
    end.and_then(|end| id.get(..end)).unwrap_or_default()
}

/// Container name without the leading `/` the engine reports.
pub fn container_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// RFC 3339 with nanosecond precision, keeping the event's offset.
pub fn format_timestamp(time: &DateTime<FixedOffset>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
