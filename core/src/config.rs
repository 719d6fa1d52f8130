/*
 * config.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, an HTTP/1.x client engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Client configuration, loadable from JSON. Every field has a default, so an
//! empty object is a valid configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::HttpError;
use crate::protocol::http::connection::ConnectionSettings;
use crate::protocol::http::pool::PoolSettings;

/// Default `User-Agent` header value.
pub const DEFAULT_USER_AGENT: &str = concat!("corriere/", env!("CARGO_PKG_VERSION"));

fn default_max_connections() -> usize {
    100
}
fn default_max_connections_per_target() -> usize {
    4
}
fn default_pipeline_depth() -> usize {
    4
}
fn default_max_waiters() -> usize {
    64
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_response_timeout_ms() -> Option<u64> {
    Some(60_000)
}
fn default_blocked_grace_ms() -> Option<u64> {
    Some(2_000)
}
fn default_max_idle_ms() -> u64 {
    15_000
}
fn default_max_redirects() -> usize {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_unit_ms() -> u64 {
    1_000
}
fn default_user_agent() -> Option<String> {
    Some(DEFAULT_USER_AGENT.to_string())
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Connections across all targets.
    pub max_connections: usize,
    pub max_connections_per_target: usize,
    /// Unanswered requests allowed on one connection.
    pub pipeline_depth: usize,
    /// Callers that may queue for a connection before `Busy`.
    pub max_waiters: usize,
    /// Longest wait for a pool slot; `None` waits indefinitely.
    pub acquire_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    /// Longest wait for response bytes; `None` disables.
    pub response_timeout_ms: Option<u64>,
    /// Silence tolerated on a reused connection after a request; `None` disables.
    pub blocked_grace_ms: Option<u64>,
    /// Idle age at which `sweep_idle` closes a connection.
    pub max_idle_ms: u64,
    /// Period of the background idle sweeper; `None` means no sweeper.
    pub sweep_interval_ms: Option<u64>,
    pub max_redirects: usize,
    pub max_retries: u32,
    /// Base retry delay, multiplied by the Fibonacci sequence.
    pub retry_unit_ms: u64,
    pub retry_jitter: bool,
    /// Added to requests without a `User-Agent`; `None` adds nothing.
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_target: default_max_connections_per_target(),
            pipeline_depth: default_pipeline_depth(),
            max_waiters: default_max_waiters(),
            acquire_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            blocked_grace_ms: default_blocked_grace_ms(),
            max_idle_ms: default_max_idle_ms(),
            sweep_interval_ms: None,
            max_redirects: default_max_redirects(),
            max_retries: default_max_retries(),
            retry_unit_ms: default_retry_unit_ms(),
            retry_jitter: false,
            user_agent: default_user_agent(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, HttpError> {
        let config: ClientConfig =
            serde_json::from_str(json).map_err(|e| HttpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HttpError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| HttpError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), HttpError> {
        let positive = [
            ("max_connections", self.max_connections),
            ("max_connections_per_target", self.max_connections_per_target),
            ("pipeline_depth", self.pipeline_depth),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(HttpError::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.max_connections_per_target > self.max_connections {
            return Err(HttpError::Config(
                "max_connections_per_target exceeds max_connections".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(HttpError::Config("connect_timeout_ms must be positive".to_string()));
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(HttpError::Config("sweep_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn retry_unit(&self) -> Duration {
        Duration::from_millis(self.retry_unit_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms.map(Duration::from_millis)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            pipeline_depth: self.pipeline_depth,
            response_timeout: self.response_timeout_ms.map(Duration::from_millis),
            blocked_grace: self.blocked_grace_ms.map(Duration::from_millis),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections,
            max_per_target: self.max_connections_per_target,
            max_waiters: self.max_waiters,
            acquire_timeout: self.acquire_timeout_ms.map(Duration::from_millis),
            connection: self.connection_settings(),
        }
    }
}
