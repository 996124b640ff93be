// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error-log muting for the ingestion loop.
//!
//! The first failure is logged and mutes the loop; further failures are only
//! counted. The next success unmutes and reports how many log lines were
//! suppressed in between. Muting only affects logging, never accounting.

use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct MuteState {
    muted: bool,
    suppressed: u64,
}

impl MuteState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Registers a failure. Returns `true` when it should be logged.
    pub fn on_failure(&mut self) -> bool {
        if self.muted {
            self.suppressed += 1;
            return false;
        }
        self.muted = true;
        true
    }

    /// Registers a success. Returns the number of failures suppressed since
    /// the loop got muted, if it was muted.
    pub fn on_success(&mut self) -> Option<u64> {
        if !self.muted {
            return None;
        }
        self.muted = false;
        Some(std::mem::take(&mut self.suppressed))
    }

    /// Logs `error` unless muted.
    pub fn failure(&mut self, stream: &str, error: &dyn std::fmt::Display) {
        if self.on_failure() {
            warn!(
                stream = %stream,
                "KINESIS | Failed to add record, muting until restored: {}", error
            );
        }
    }

    /// Unmutes, logging how much was suppressed.
    pub fn success(&mut self, stream: &str) {
        if let Some(suppressed) = self.on_success() {
            info!(
                stream = %stream,
                suppressed,
                "KINESIS | Ingestion restored, {} failures suppressed while muted", suppressed
            );
        }
    }
}
