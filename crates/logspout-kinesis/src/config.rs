// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adapter configuration.
//!
//! Every option is looked up in the route options first, then in its `LK_*`
//! environment variable, then falls back to the default from
//! [`crate::constants`]. A value that is present but malformed is an error:
//! nothing silently falls back to a default once a value was supplied.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_BUFFER_SIZE, DEFAULT_DOCKER_HOST, DEFAULT_DRAIN_TIMEOUT,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_ATTEMPTS_PER_RECORD, DEFAULT_RETRY_BACKOFF,
    DEFAULT_SINK_TIMEOUT, DEFAULT_STATS_INTERVAL, DEFAULT_TRANSPORT_RETRIES, MAX_BATCH_SIZE,
    MAX_PARTITION_KEY_LENGTH,
};
use crate::errors::ConfigError;
use crate::transform::EnvelopeVersion;

const ROUTE_SCHEME: &str = "kinesis";

/// Route as supplied by the host: the target stream and free-form options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteConfig {
    pub stream_name: String,
    pub options: HashMap<String, String>,
}

impl RouteConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            options: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Parses a logspout style route, `kinesis://<stream>?key=value&key=value`.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRoute {
            route: uri.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(uri.trim()).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != ROUTE_SCHEME {
            return Err(invalid("expected a kinesis:// route"));
        }
        let stream_name = url.host_str().unwrap_or_default();
        if stream_name.is_empty() {
            return Err(invalid("missing stream name"));
        }
        if !matches!(url.path(), "" | "/") {
            return Err(invalid("unexpected path after the stream name"));
        }

        let mut options = HashMap::new();
        for (key, value) in url.query_pairs() {
            if key.is_empty() {
                return Err(invalid("option with an empty name"));
            }
            options.insert(key.into_owned(), value.into_owned());
        }

        Ok(Self {
            stream_name: stream_name.to_string(),
            options,
        })
    }
}

/// What `add` does when the buffer has no free slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FullBufferPolicy {
    /// Fail immediately; the record is dropped and counted.
    #[default]
    Reject,
    /// Suspend the caller until the delivery worker frees a slot.
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub buffer_size: usize,
    pub full_buffer_policy: FullBufferPolicy,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_attempts_per_record: u32,
    pub stats_interval: Duration,
    /// Caller-side timeout of a single bulk write.
    pub sink_timeout: Duration,
    /// Bulk-write retries on retryable transport errors.
    pub transport_retries: u32,
    pub retry_backoff: Duration,
    /// Cap on the final flush performed while stopping.
    pub drain_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            full_buffer_policy: FullBufferPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_attempts_per_record: DEFAULT_MAX_ATTEMPTS_PER_RECORD,
            stats_interval: DEFAULT_STATS_INTERVAL,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
            transport_retries: DEFAULT_TRANSPORT_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.batch_size > self.buffer_size {
            return Err(ConfigError::Invalid(format!(
                "batch_size ({}) cannot exceed buffer_size ({})",
                self.batch_size, self.buffer_size
            )));
        }
        if self.max_attempts_per_record == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts_per_record must be greater than 0".to_string(),
            ));
        }
        let intervals = [
            ("flush_interval_ms", self.flush_interval),
            ("stats_interval_ms", self.stats_interval),
            ("sink_timeout_ms", self.sink_timeout),
            ("drain_timeout_ms", self.drain_timeout),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Fully resolved configuration of one adapter instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub stream_name: String,
    /// Host label written into every envelope; also the partition key.
    pub docker_host: String,
    pub envelope_version: EnvelopeVersion,
    pub batch: BatchConfig,
}

impl AdapterConfig {
    /// Resolves the configuration from route options with the process
    /// environment as fallback.
    pub fn from_route_env(route: &RouteConfig) -> Result<Self, ConfigError> {
        Self::from_route(route, |name| env::var(name).ok())
    }

    /// Resolves the configuration from route options, using `lookup` for the
    /// environment fallback.
    pub fn from_route<F>(route: &RouteConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let options = Options {
            route,
            lookup: &lookup,
        };

        let stream_name = route.stream_name.trim().to_string();
        if stream_name.is_empty() {
            return Err(ConfigError::Invalid(
                "stream name cannot be empty".to_string(),
            ));
        }

        let defaults = BatchConfig::default();
        let full_buffer_policy = if options.parse_bool(
            "add_blocks_when_buffer_full",
            "LK_ADD_BLOCKS_WHEN_BUFFER_FULL",
            false,
        )? {
            FullBufferPolicy::Block
        } else {
            FullBufferPolicy::Reject
        };

        let batch = BatchConfig {
            buffer_size: options.parse("buffer_size", "LK_BUFFER_SIZE", defaults.buffer_size)?,
            full_buffer_policy,
            batch_size: options.parse("batch_size", "LK_BATCH_SIZE", defaults.batch_size)?,
            flush_interval: options.parse_millis(
                "flush_interval_ms",
                "LK_FLUSH_INTERVAL_MS",
                defaults.flush_interval,
            )?,
            max_attempts_per_record: options.parse(
                "max_attempts_per_record",
                "LK_MAX_ATTEMPTS_PER_RECORD",
                defaults.max_attempts_per_record,
            )?,
            stats_interval: options.parse_millis(
                "stats_interval_ms",
                "LK_STATS_INTERVAL_MS",
                defaults.stats_interval,
            )?,
            sink_timeout: options.parse_millis(
                "sink_timeout_ms",
                "LK_SINK_TIMEOUT_MS",
                defaults.sink_timeout,
            )?,
            transport_retries: options.parse(
                "transport_retries",
                "LK_TRANSPORT_RETRIES",
                defaults.transport_retries,
            )?,
            retry_backoff: options.parse_millis(
                "retry_backoff_ms",
                "LK_RETRY_BACKOFF_MS",
                defaults.retry_backoff,
            )?,
            drain_timeout: options.parse_millis(
                "drain_timeout_ms",
                "LK_DRAIN_TIMEOUT_MS",
                defaults.drain_timeout,
            )?,
        };
        batch.validate()?;

        let envelope_version = if options.parse_bool("use_v0_layout", "LK_USE_V0_LAYOUT", false)? {
            EnvelopeVersion::V0
        } else {
            EnvelopeVersion::V1
        };

        let docker_host = options
            .get("docker_host", "LK_DOCKER_HOST")
            .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string());
        if docker_host.chars().count() > MAX_PARTITION_KEY_LENGTH {
            return Err(ConfigError::InvalidOption {
                option: "docker_host",
                value: docker_host,
                reason: format!("longer than {MAX_PARTITION_KEY_LENGTH} characters"),
            });
        }

        Ok(Self {
            stream_name,
            docker_host,
            envelope_version,
            batch,
        })
    }

    /// Partition key used for every record of this adapter.
    pub fn partition_key(&self) -> &str {
        &self.docker_host
    }
}

struct Options<'a, F> {
    route: &'a RouteConfig,
    lookup: &'a F,
}

impl<F> Options<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Route option first, then the environment; empty values count as unset.
    fn get(&self, option: &str, env_var: &str) -> Option<String> {
        self.route
            .options
            .get(option)
            .cloned()
            .filter(|value| !value.is_empty())
            .or_else(|| (self.lookup)(env_var).filter(|value| !value.is_empty()))
    }

    fn parse<T>(&self, option: &'static str, env_var: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(option, env_var) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidOption {
                    option,
                    value,
                    reason: e.to_string(),
                }),
        }
    }

    fn parse_millis(
        &self,
        option: &'static str,
        env_var: &str,
        default: Duration,
    ) -> Result<Duration, ConfigError> {
        let default_millis = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(option, env_var, default_millis)
            .map(Duration::from_millis)
    }

    fn parse_bool(
        &self,
        option: &'static str,
        env_var: &str,
        default: bool,
    ) -> Result<bool, ConfigError> {
        let Some(value) = self.get(option, env_var) else {
            return Ok(default);
        };
        match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidOption {
                option,
                value,
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}
