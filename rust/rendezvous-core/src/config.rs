// rust/rendezvous-core/src/config.rs

//! Configuration management for the rendezvous.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RendezvousError, Result};

// Top-level rendezvous configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    pub rendezvous: RendezvousSettings,
    pub timeouts: TimeoutConfig,
    pub retry: RetrySettings,
    pub server: ServerConfig,
}

/// Invocation parameters of one rendezvous.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSettings {
    /// Rank of this process; 0 generates and broadcasts the id.
    pub rank: u32,
    /// This process's listen address, `host:port`. Required for rank != 0.
    pub endpoint: String,
    /// Peer listen addresses rank 0 sends to.
    pub other_endpoints: Vec<String>,
    /// Name the identifier travels under.
    pub variable_name: String,
}

/// Deadlines, in milliseconds. A value of 0 means wait indefinitely
/// for the two rendezvous waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    // Deadline for both broadcast waves on rank 0.
    pub broadcast_timeout_ms: u64,
    // Deadline for a peer waiting on its completion signal.
    pub receive_timeout_ms: u64,
    // Per-attempt TCP connect timeout.
    pub connect_timeout_ms: u64,
    // Per-request RPC timeout.
    pub request_timeout_ms: u64,
    // Pause between connection attempts while a peer is not listening yet.
    pub connect_poll_interval_ms: u64,
}

/// Retry policy for transient RPC failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt. 0 fails on the first error.
    pub max_retries: u32,
    /// Initial delay (milliseconds) between retries.
    pub retry_delay_ms: u64,
    /// Maximum delay (milliseconds) between retries.
    pub max_retry_delay_ms: u64,
}

/// Ephemeral endpoint options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen backlog of the single-use server.
    pub backlog: u32,
    /// How long shutdown waits for open connections before aborting them.
    pub shutdown_grace_ms: u64,
}

impl Default for RendezvousSettings {
    fn default() -> Self {
        Self {
            rank: 0,
            endpoint: String::new(),
            other_endpoints: Vec::new(),
            variable_name: "NCCLID".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            broadcast_timeout_ms: 300_000,
            receive_timeout_ms: 300_000,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            connect_poll_interval_ms: 100,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 100,
            max_retry_delay_ms: 5_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: 1,
            shutdown_grace_ms: 5_000,
        }
    }
}

fn optional_duration(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TimeoutConfig {
    pub fn broadcast_timeout(&self) -> Option<Duration> {
        optional_duration(self.broadcast_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        optional_duration(self.receive_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Splits a `host:port` endpoint.
///
/// IPv6 hosts must be bracketed, e.g. `[::1]:7000`.
///
/// # Errors
///
/// Returns a configuration error if the host is empty or the port is not a
/// valid `u16`.
pub fn parse_endpoint(endpoint: &str) -> Result<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
        RendezvousError::config(format!("endpoint '{}' must be host:port", endpoint))
    })?;
    if host.is_empty() {
        return Err(RendezvousError::config(format!(
            "endpoint '{}' has an empty host",
            endpoint
        )));
    }
    let port = port.parse::<u16>().map_err(|e| {
        RendezvousError::config_with_source(
            format!("endpoint '{}' has an invalid port", endpoint),
            e,
        )
    })?;
    Ok((host, port))
}

impl FromStr for RendezvousConfig {
    type Err = RendezvousError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| RendezvousError::config_with_source("failed to parse TOML config", e))
    }
}

impl RendezvousConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    // Parse a TOML file without validating it, for callers that layer
    // further overrides on top before validation.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RendezvousError::config_with_source(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        content.parse()
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `RDV_`. For example:
    // - `RDV_RANK` overrides `rendezvous.rank`
    // - `RDV_OTHER_ENDPOINTS` overrides `rendezvous.other_endpoints` (comma separated)
    // - `RDV_RECEIVE_TIMEOUT_MS` overrides `timeouts.receive_timeout_ms`
    // - `RDV_SERVER_BACKLOG` overrides `server.backlog`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Rendezvous overrides
        if let Ok(val) = std::env::var("RDV_RANK") {
            if let Ok(v) = val.parse() {
                self.rendezvous.rank = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_ENDPOINT") {
            self.rendezvous.endpoint = val;
        }
        if let Ok(val) = std::env::var("RDV_OTHER_ENDPOINTS") {
            self.rendezvous.other_endpoints = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(val) = std::env::var("RDV_VARIABLE_NAME") {
            self.rendezvous.variable_name = val;
        }

        // Timeout overrides
        if let Ok(val) = std::env::var("RDV_BROADCAST_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.timeouts.broadcast_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_RECEIVE_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.timeouts.receive_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_CONNECT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.timeouts.connect_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_REQUEST_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.timeouts.request_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_CONNECT_POLL_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.timeouts.connect_poll_interval_ms = v;
            }
        }

        // Retry overrides
        if let Ok(val) = std::env::var("RDV_MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                self.retry.max_retries = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_RETRY_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.retry.retry_delay_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_MAX_RETRY_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.retry.max_retry_delay_ms = v;
            }
        }

        // Server overrides
        if let Ok(val) = std::env::var("RDV_SERVER_BACKLOG") {
            if let Ok(v) = val.parse() {
                self.server.backlog = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_SERVER_SHUTDOWN_GRACE_MS") {
            if let Ok(v) = val.parse() {
                self.server.shutdown_grace_ms = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        let settings = &self.rendezvous;

        if settings.variable_name.is_empty() {
            return Err(RendezvousError::config(
                "rendezvous.variable_name must not be empty",
            ));
        }

        if settings.rank != 0 && settings.endpoint.is_empty() {
            return Err(RendezvousError::config(format!(
                "rendezvous.endpoint is required for rank {}",
                settings.rank
            )));
        }
        if !settings.endpoint.is_empty() {
            parse_endpoint(&settings.endpoint)?;
        }

        let mut seen = HashSet::new();
        for endpoint in &settings.other_endpoints {
            parse_endpoint(endpoint)?;
            if !seen.insert(endpoint.as_str()) {
                return Err(RendezvousError::config(format!(
                    "rendezvous.other_endpoints lists '{}' more than once",
                    endpoint
                )));
            }
        }

        // Timeout validation
        if self.timeouts.connect_timeout_ms == 0 {
            return Err(RendezvousError::config(
                "timeouts.connect_timeout_ms must be greater than 0",
            ));
        }
        if self.timeouts.request_timeout_ms == 0 {
            return Err(RendezvousError::config(
                "timeouts.request_timeout_ms must be greater than 0",
            ));
        }
        if self.timeouts.connect_poll_interval_ms == 0 {
            return Err(RendezvousError::config(
                "timeouts.connect_poll_interval_ms must be greater than 0",
            ));
        }

        // Retry validation
        if self.retry.max_retry_delay_ms < self.retry.retry_delay_ms {
            return Err(RendezvousError::config(
                "retry.max_retry_delay_ms must be at least retry.retry_delay_ms",
            ));
        }

        // Server validation
        if self.server.backlog == 0 {
            return Err(RendezvousError::config(
                "server.backlog must be greater than 0",
            ));
        }
        if self.server.shutdown_grace_ms == 0 {
            return Err(RendezvousError::config(
                "server.shutdown_grace_ms must be greater than 0",
            ));
        }

        Ok(())
    }
}
