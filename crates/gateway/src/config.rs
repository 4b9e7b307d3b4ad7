//! Gateway configuration, read from the environment.

use crate::error::{GatewayError, Result};
use std::str::FromStr;
use std::time::Duration;
use store_client::{StoreClientConfig, DEFAULT_STORE_URL};

/// Default number of change events kept for replay.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 1024;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port for the HTTP and WebSocket surfaces.
    pub http_port: u16,
    /// Port for the Prometheus exporter. `None` disables it.
    pub metrics_port: Option<u16>,
    /// Base URL of the authoritative store.
    pub store_url: String,
    /// Timeout for a single store call.
    pub store_timeout: Duration,
    /// Retries after a store call saw no response.
    pub store_retries: u32,
    /// Change events retained for replay to reconnecting subscribers.
    pub backlog_capacity: usize,
    /// Live messages a subscriber may have queued before it is dropped.
    pub subscriber_buffer: usize,
    /// Bound on a single socket write to a subscriber.
    pub delivery_timeout: Duration,
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// A connection silent for this long is considered dead.
    pub idle_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 3000,
            metrics_port: Some(9094),
            store_url: DEFAULT_STORE_URL.to_string(),
            store_timeout: Duration::from_millis(2000),
            store_retries: 1,
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            subscriber_buffer: crate::hub::DEFAULT_SUBSCRIBER_BUFFER,
            delivery_timeout: Duration::from_millis(5000),
            ping_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults for
    /// unset variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let metrics_port = match parse::<u16>(&lookup, "METRICS_PORT")? {
            Some(0) => None,
            Some(port) => Some(port),
            None => defaults.metrics_port,
        };

        let config = Self {
            http_port: parse(&lookup, "HTTP_PORT")?.unwrap_or(defaults.http_port),
            metrics_port,
            store_url: lookup("STORE_URL").unwrap_or(defaults.store_url),
            store_timeout: parse(&lookup, "STORE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            store_retries: parse(&lookup, "STORE_RETRIES")?.unwrap_or(defaults.store_retries),
            backlog_capacity: parse(&lookup, "BACKLOG_CAPACITY")?.unwrap_or(defaults.backlog_capacity),
            subscriber_buffer: parse(&lookup, "SUBSCRIBER_BUFFER")?
                .unwrap_or(defaults.subscriber_buffer),
            delivery_timeout: parse(&lookup, "DELIVERY_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.delivery_timeout),
            ping_interval: parse(&lookup, "PING_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.ping_interval),
            idle_timeout: parse(&lookup, "IDLE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.backlog_capacity == 0 {
            return Err(GatewayError::Config("BACKLOG_CAPACITY must be at least 1".into()));
        }
        if self.subscriber_buffer == 0 {
            return Err(GatewayError::Config("SUBSCRIBER_BUFFER must be at least 1".into()));
        }
        if self.delivery_timeout.is_zero() {
            return Err(GatewayError::Config("DELIVERY_TIMEOUT_MS must be positive".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(GatewayError::Config("PING_INTERVAL_SECS must be positive".into()));
        }
        if self.idle_timeout <= self.ping_interval {
            return Err(GatewayError::Config(
                "IDLE_TIMEOUT_SECS must exceed PING_INTERVAL_SECS".into(),
            ));
        }
        Ok(())
    }

    /// Settings for the store client.
    pub fn store_client(&self) -> StoreClientConfig {
        StoreClientConfig {
            base_url: self.store_url.clone(),
            timeout: self.store_timeout,
            retries: self.store_retries,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| GatewayError::Config(format!("{} must be a number, got '{}': {}", name, raw, e))),
    }
}
