// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships container log records to Amazon Kinesis Data Streams.
//!
//! Records arrive from a host log router, are transformed into a versioned
//! JSON envelope ([`transform`]), buffered with a bounded capacity
//! ([`buffer`]), cut into batches ([`scheduler`]) and written to the stream
//! with per-record retry ([`delivery`]). [`adapter::KinesisAdapter`] wires the
//! pipeline together and owns its lifecycle. [`reader`] reads a stream back
//! for checking what was delivered.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod adapter;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod errors;
pub mod kinesis;
pub mod message;
pub mod mute;
pub mod reader;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod transform;
