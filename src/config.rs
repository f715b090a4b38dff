//! Endpoint configuration.
//!
//! [`EndpointConfig`] carries everything both halves of the link need:
//! where to listen, which source port identifies the peer, how long to wait
//! for the peer to show up, how long to wait for each frame, how much to read
//! per frame and the sentinel that ends a session.
//!
//! Configs are immutable once built and are validated at construction.
//!
//! # Example
//!
//! ```
//! use peerlink::EndpointConfig;
//! use std::time::Duration;
//!
//! let config = EndpointConfig::builder()
//!     .local_port(50001)
//!     .peer_port(50002)
//!     .receive_timeout(Duration::from_secs(30))
//!     .sentinel("end!")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.peer_port(), 50002);
//! assert_eq!(config.receive_timeout(), Some(Duration::from_secs(30)));
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{LinkError, Result};

/// Default bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default local (listening) port.
pub const DEFAULT_LOCAL_PORT: u16 = 50001;

/// Default expected peer source port.
pub const DEFAULT_PEER_PORT: u16 = 50002;

/// Default wait for the next frame once established.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default wait for the peer to connect.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Default read size per frame (8 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default termination sentinel.
pub const DEFAULT_SENTINEL: &str = "end!";

/// Validated, immutable connection parameters.
///
/// Timeouts are `None` when the wait is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    local_host: String,
    local_port: u16,
    peer_port: u16,
    build_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    buffer_size: usize,
    sentinel: String,
}

impl EndpointConfig {
    /// Create a builder seeded with the defaults.
    pub fn builder() -> EndpointConfigBuilder {
        EndpointConfigBuilder::new()
    }

    /// Parse and validate a JSON settings document.
    ///
    /// See [`EndpointSettings`] for the accepted keys.
    pub fn from_json(text: &str) -> Result<Self> {
        let settings: EndpointSettings = serde_json::from_str(text)?;
        settings.into_config()
    }

    /// Host the listener binds to.
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Port the listener binds to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Source port an inbound connection must come from to be accepted.
    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    /// Maximum wait for a matching peer, `None` for unbounded.
    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout
    }

    /// Maximum wait for each frame once established, `None` for unbounded.
    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout
    }

    /// Maximum bytes read per frame.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Literal text that terminates a session.
    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    fn validate(&self) -> Result<()> {
        if self.local_host.trim().is_empty() {
            return Err(LinkError::InvalidConfig("local host is empty".into()));
        }
        if self.local_port == 0 {
            return Err(LinkError::InvalidConfig(
                "local port must be in 1..=65535".into(),
            ));
        }
        if self.peer_port == 0 {
            return Err(LinkError::InvalidConfig(
                "peer port must be in 1..=65535".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(LinkError::InvalidConfig(
                "buffer size must be greater than zero".into(),
            ));
        }
        if self.sentinel.is_empty() {
            return Err(LinkError::InvalidConfig("sentinel is empty".into()));
        }
        if self.sentinel.len() > self.buffer_size {
            return Err(LinkError::InvalidConfig(format!(
                "sentinel ({} bytes) does not fit in the read buffer ({} bytes)",
                self.sentinel.len(),
                self.buffer_size
            )));
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            local_host: DEFAULT_HOST.to_string(),
            local_port: DEFAULT_LOCAL_PORT,
            peer_port: DEFAULT_PEER_PORT,
            build_timeout: Some(DEFAULT_BUILD_TIMEOUT),
            receive_timeout: Some(DEFAULT_RECEIVE_TIMEOUT),
            buffer_size: DEFAULT_BUFFER_SIZE,
            sentinel: DEFAULT_SENTINEL.to_string(),
        }
    }
}

/// Fluent builder for [`EndpointConfig`].
#[derive(Debug, Clone)]
pub struct EndpointConfigBuilder {
    config: EndpointConfig,
}

impl EndpointConfigBuilder {
    /// Create a builder seeded with the defaults.
    pub fn new() -> Self {
        Self {
            config: EndpointConfig::default(),
        }
    }

    /// Set the bind host.
    ///
    /// Default: `127.0.0.1`
    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    /// Set the listening port.
    ///
    /// Default: 50001
    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    /// Set the expected peer source port.
    ///
    /// Default: 50002
    pub fn peer_port(mut self, port: u16) -> Self {
        self.config.peer_port = port;
        self
    }

    /// Set the establishment timeout. `Duration::ZERO` waits forever.
    ///
    /// Default: 300 seconds
    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.config.build_timeout = bounded(timeout);
        self
    }

    /// Set the per-frame receive timeout. `Duration::ZERO` waits forever.
    ///
    /// Default: 120 seconds
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout = bounded(timeout);
        self
    }

    /// Set the read size per frame.
    ///
    /// Default: 8192
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the termination sentinel.
    ///
    /// Default: `"end!"`
    pub fn sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.config.sentinel = sentinel.into();
        self
    }

    /// Validate and build the config.
    pub fn build(self) -> Result<EndpointConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EndpointConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serde form of the endpoint settings.
///
/// Timeouts are in seconds; zero or negative means no timeout. Missing keys
/// take the defaults.
///
/// ```
/// use peerlink::EndpointConfig;
///
/// let config = EndpointConfig::from_json(
///     r#"{"port_this": 9000, "port_peer": 9001, "timeout_receiving": 0}"#,
/// )
/// .unwrap();
///
/// assert_eq!(config.local_port(), 9000);
/// assert_eq!(config.receive_timeout(), None);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointSettings {
    pub ip: String,
    pub port_this: u16,
    pub port_peer: u16,
    pub timeout_receiving: f64,
    pub timeout_establishing: f64,
    pub buffer_size: usize,
    pub finish_code: String,
}

impl EndpointSettings {
    /// Convert into a validated [`EndpointConfig`].
    pub fn into_config(self) -> Result<EndpointConfig> {
        let config = EndpointConfig {
            local_host: self.ip,
            local_port: self.port_this,
            peer_port: self.port_peer,
            build_timeout: seconds("timeout_establishing", self.timeout_establishing)?,
            receive_timeout: seconds("timeout_receiving", self.timeout_receiving)?,
            buffer_size: self.buffer_size,
            sentinel: self.finish_code,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            ip: DEFAULT_HOST.to_string(),
            port_this: DEFAULT_LOCAL_PORT,
            port_peer: DEFAULT_PEER_PORT,
            timeout_receiving: DEFAULT_RECEIVE_TIMEOUT.as_secs_f64(),
            timeout_establishing: DEFAULT_BUILD_TIMEOUT.as_secs_f64(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            finish_code: DEFAULT_SENTINEL.to_string(),
        }
    }
}

fn bounded(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

fn seconds(field: &str, secs: f64) -> Result<Option<Duration>> {
    if secs.is_nan() {
        return Err(LinkError::InvalidConfig(format!("{field} is NaN")));
    }
    if secs <= 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| LinkError::InvalidConfig(format!("{field}: {e}")))
}
