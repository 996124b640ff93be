// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records as handed over by the host log router.

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use std::collections::BTreeMap;

/// A single line of container output, owned by the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawLogEvent {
    /// The log line itself.
    pub data: String,
    /// Emission time, with the offset the host recorded it in.
    pub time: DateTime<FixedOffset>,
    /// Originating stream, `stdout` or `stderr`.
    pub source: String,
    pub container: Container,
}

/// Identity of the container that produced a [`RawLogEvent`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Container {
    /// Full 64-hex-character container id.
    pub id: String,
    /// Container name as reported by the engine, with its leading `/`.
    pub name: String,
    #[serde(default)]
    pub config: ContainerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContainerConfig {
    /// Image reference, `repository[:tag]`.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}
