//! Session configuration.
//!
//! [`SessionConfig`] holds every tunable of a client session. Build it with
//! [`SessionConfig::builder`]; `build()` validates the result so a bad
//! configuration is rejected before any byte hits the network.
//!
//! ```rust
//! use kestrel_proto::ssh::config::SessionConfig;
//! use std::time::Duration;
//!
//! let config = SessionConfig::builder()
//!     .with_operation_timeout(Duration::from_secs(5))
//!     .with_window_size(4 * 1024 * 1024)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.window_low_water, 2 * 1024 * 1024);
//! ```

use crate::ssh::connection::MAX_PACKET_SIZE as MAX_CHANNEL_PACKET;
use crate::ssh::error::{Error, Result};
use crate::ssh::hostkey::{HostKeyCallback, HostKeyInfo};
use crate::ssh::kex_dh::GroupRange;
use crate::ssh::packet::MAX_PACKET_SIZE;
use crate::ssh::registry::{AlgorithmRegistry, Preferences};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default channel receive window (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum channel packet (32 KiB).
pub const DEFAULT_CHANNEL_MAX_PACKET: u32 = 32 * 1024;

/// Default rekey volume (1 GiB, both directions combined).
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

/// Default rekey interval (1 hour).
pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(3600);

/// Accepts every host key, logging its fingerprint.
fn accept_any_host_key(info: &HostKeyInfo) -> bool {
    warn!(
        algorithm = %info.algorithm,
        fingerprint = %info.fingerprint,
        "Accepting server host key without verification"
    );
    true
}

/// Client session configuration.
#[derive(Clone)]
pub struct SessionConfig {
    /// Software version sent in the identification line
    pub software_version: String,
    /// TCP connect timeout (used by `connect_tcp`)
    pub connect_timeout: Duration,
    /// Timeout for version exchange plus initial key exchange
    pub handshake_timeout: Duration,
    /// Timeout for blocking operations (opens, requests, window waits)
    pub operation_timeout: Duration,
    /// Largest inbound packet accepted by the codec
    pub max_packet_size: usize,
    /// Algorithms this session may use
    pub registry: Arc<AlgorithmRegistry>,
    /// Algorithm proposal order
    pub preferences: Preferences,
    /// Host key acceptance hook
    pub host_key_callback: HostKeyCallback,
    /// Rekey after this many bytes in both directions
    pub rekey_bytes: u64,
    /// Rekey after this much time
    pub rekey_interval: Duration,
    /// Send SSH_MSG_IGNORE at this interval
    pub keepalive_interval: Option<Duration>,
    /// Initial receive window for channels we open
    pub window_size: u32,
    /// Maximum packet we accept per channel
    pub channel_max_packet: u32,
    /// Send WINDOW_ADJUST once the receive window drops below this
    pub window_low_water: u32,
    /// Prime sizes requested during group exchange
    pub group_range: GroupRange,
    /// Accept server-initiated channels (forwarded-tcpip, x11)
    pub accept_incoming_channels: bool,
}

impl SessionConfig {
    /// Create builder for session configuration
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let software_ok = !self.software_version.is_empty()
            && self
                .software_version
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b'-');
        if !software_ok {
            return Err(Error::Config(format!(
                "software version '{}' must be printable ASCII without spaces or '-'",
                self.software_version
            )));
        }
        if self.connect_timeout.is_zero()
            || self.handshake_timeout.is_zero()
            || self.operation_timeout.is_zero()
        {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        if self.max_packet_size < MAX_PACKET_SIZE {
            return Err(Error::Config(format!(
                "max_packet_size must be at least {}",
                MAX_PACKET_SIZE
            )));
        }
        if self.channel_max_packet == 0 || self.channel_max_packet > MAX_CHANNEL_PACKET {
            return Err(Error::Config(format!(
                "channel_max_packet must be in 1..={}",
                MAX_CHANNEL_PACKET
            )));
        }
        // Room for the CHANNEL_DATA header, padding and MAC
        if self.channel_max_packet as usize + 256 > self.max_packet_size {
            return Err(Error::Config(
                "channel_max_packet does not fit into max_packet_size".into(),
            ));
        }
        if self.window_size < self.channel_max_packet {
            return Err(Error::Config(
                "window_size must be at least channel_max_packet".into(),
            ));
        }
        if self.window_low_water >= self.window_size {
            return Err(Error::Config(
                "window_low_water must be below window_size".into(),
            ));
        }
        if self.rekey_bytes == 0 || self.rekey_interval.is_zero() {
            return Err(Error::Config("rekey limits must be non-zero".into()));
        }
        if matches!(self.keepalive_interval, Some(d) if d.is_zero()) {
            return Err(Error::Config("keepalive interval must be non-zero".into()));
        }
        let range = &self.group_range;
        if range.min < 1024 || range.min > range.preferred || range.preferred > range.max {
            return Err(Error::Config(format!(
                "invalid group exchange range {}/{}/{}",
                range.min, range.preferred, range.max
            )));
        }
        self.preferences.validate(&self.registry)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let registry = Arc::new(AlgorithmRegistry::default());
        Self {
            software_version: format!("Kestrel_{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(30),
            max_packet_size: MAX_PACKET_SIZE,
            preferences: Preferences::from_registry(&registry),
            registry,
            host_key_callback: Arc::new(accept_any_host_key),
            rekey_bytes: DEFAULT_REKEY_BYTES,
            rekey_interval: DEFAULT_REKEY_INTERVAL,
            keepalive_interval: None,
            window_size: DEFAULT_WINDOW_SIZE,
            channel_max_packet: DEFAULT_CHANNEL_MAX_PACKET,
            window_low_water: DEFAULT_WINDOW_SIZE / 2,
            group_range: GroupRange::default(),
            accept_incoming_channels: false,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("software_version", &self.software_version)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("max_packet_size", &self.max_packet_size)
            .field("preferences", &self.preferences)
            .field("rekey_bytes", &self.rekey_bytes)
            .field("rekey_interval", &self.rekey_interval)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("window_size", &self.window_size)
            .field("channel_max_packet", &self.channel_max_packet)
            .field("window_low_water", &self.window_low_water)
            .field("group_range", &self.group_range)
            .field("accept_incoming_channels", &self.accept_incoming_channels)
            .finish_non_exhaustive()
    }
}

/// Builder for SessionConfig
#[derive(Default)]
pub struct SessionConfigBuilder {
    software_version: Option<String>,
    connect_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
    operation_timeout: Option<Duration>,
    max_packet_size: Option<usize>,
    registry: Option<Arc<AlgorithmRegistry>>,
    preferences: Option<Preferences>,
    host_key_callback: Option<HostKeyCallback>,
    rekey_bytes: Option<u64>,
    rekey_interval: Option<Duration>,
    keepalive_interval: Option<Duration>,
    window_size: Option<u32>,
    channel_max_packet: Option<u32>,
    window_low_water: Option<u32>,
    group_range: Option<GroupRange>,
    accept_incoming_channels: bool,
}

impl SessionConfigBuilder {
    /// Create new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set software version for the identification line
    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = Some(version.into());
        self
    }

    /// Set TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Set timeout for blocking operations
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Set maximum inbound packet size
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = Some(size);
        self
    }

    /// Set algorithm registry; preferences default to its order
    pub fn with_registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Set algorithm preferences
    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = Some(preferences);
        self
    }

    /// Set host key acceptance hook
    pub fn with_host_key_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&HostKeyInfo) -> bool + Send + Sync + 'static,
    {
        self.host_key_callback = Some(Arc::new(callback));
        self
    }

    /// Set rekey volume
    pub fn with_rekey_bytes(mut self, bytes: u64) -> Self {
        self.rekey_bytes = Some(bytes);
        self
    }

    /// Set rekey interval
    pub fn with_rekey_interval(mut self, interval: Duration) -> Self {
        self.rekey_interval = Some(interval);
        self
    }

    /// Enable keepalive
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Set initial channel window; the low-water mark defaults to half
    pub fn with_window_size(mut self, size: u32) -> Self {
        self.window_size = Some(size);
        self
    }

    /// Set maximum channel packet
    pub fn with_channel_max_packet(mut self, size: u32) -> Self {
        self.channel_max_packet = Some(size);
        self
    }

    /// Set window low-water mark
    pub fn with_window_low_water(mut self, bytes: u32) -> Self {
        self.window_low_water = Some(bytes);
        self
    }

    /// Set group exchange prime sizes
    pub fn with_group_range(mut self, range: GroupRange) -> Self {
        self.group_range = Some(range);
        self
    }

    /// Accept server-initiated channels
    pub fn accept_incoming_channels(mut self, accept: bool) -> Self {
        self.accept_incoming_channels = accept;
        self
    }

    /// Build SessionConfig with validation
    pub fn build(self) -> Result<SessionConfig> {
        let defaults = SessionConfig::default();
        let registry = self.registry.unwrap_or(defaults.registry);
        let preferences = self
            .preferences
            .unwrap_or_else(|| Preferences::from_registry(&registry));
        let window_size = self.window_size.unwrap_or(defaults.window_size);

        let config = SessionConfig {
            software_version: self.software_version.unwrap_or(defaults.software_version),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            handshake_timeout: self.handshake_timeout.unwrap_or(defaults.handshake_timeout),
            operation_timeout: self.operation_timeout.unwrap_or(defaults.operation_timeout),
            max_packet_size: self.max_packet_size.unwrap_or(defaults.max_packet_size),
            registry,
            preferences,
            host_key_callback: self
                .host_key_callback
                .unwrap_or(defaults.host_key_callback),
            rekey_bytes: self.rekey_bytes.unwrap_or(defaults.rekey_bytes),
            rekey_interval: self.rekey_interval.unwrap_or(defaults.rekey_interval),
            keepalive_interval: self.keepalive_interval,
            window_size,
            channel_max_packet: self
                .channel_max_packet
                .unwrap_or(defaults.channel_max_packet),
            window_low_water: self.window_low_water.unwrap_or(window_size / 2),
            group_range: self.group_range.unwrap_or(defaults.group_range),
            accept_incoming_channels: self.accept_incoming_channels,
        };

        config.validate()?;
        Ok(config)
    }
}
