use std::net::SocketAddr;

/// Configuration for a UDP receiver port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpReceiverConfig {
    /// Address to bind. Port 0 selects a kernel-chosen port; on success the
    /// field is rewritten to the actually bound address.
    pub bind_address: SocketAddr,
}

impl Default for UdpReceiverConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

/// Configuration for a UDP sender port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpSenderConfig {
    /// Address to bind. Port 0 selects a kernel-chosen port; on success the
    /// field is rewritten to the actually bound address.
    pub bind_address: SocketAddr,
    /// Enable SO_BROADCAST on the socket.
    pub broadcast: bool,
}

impl Default for UdpSenderConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            broadcast: false,
        }
    }
}

/// Configuration for the event loop driver.
#[derive(Clone)]
pub struct Config {
    /// Number of SQ entries. CQ will be 4x this.
    pub sq_entries: u32,
    /// Maximum number of ports (direct descriptors) managed by the loop.
    pub max_ports: u32,
    /// Size of the per-port receive buffer in bytes. Datagrams larger than
    /// this are truncated by the kernel.
    pub recv_buffer_size: usize,
    /// Maximum queued outbound datagrams per sender port while a send is
    /// in flight. Overflow drops the datagram.
    pub send_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            max_ports: 64,
            recv_buffer_size: 65536,
            send_queue_depth: 256,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(crate::error::Error::Config(
                "sq_entries must be > 0 and a power of two".into(),
            ));
        }
        if self.max_ports == 0 || self.max_ports >= (1 << 24) {
            return Err(crate::error::Error::Config(
                "max_ports must be > 0 and < 2^24".into(),
            ));
        }
        if self.recv_buffer_size == 0 {
            return Err(crate::error::Error::Config(
                "recv_buffer_size must be > 0".into(),
            ));
        }
        if self.send_queue_depth == 0 {
            return Err(crate::error::Error::Config(
                "send_queue_depth must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use packetline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .sq_entries(128)
///     .max_ports(32)
///     .recv_buffer_size(9000)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of SQ entries. CQ will be 4x this. Must be a power of 2.
    pub fn sq_entries(mut self, n: u32) -> Self {
        self.config.sq_entries = n;
        self
    }

    /// Set the maximum number of ports managed by the loop.
    pub fn max_ports(mut self, n: u32) -> Self {
        self.config.max_ports = n;
        self
    }

    /// Set the per-port receive buffer size in bytes.
    pub fn recv_buffer_size(mut self, n: usize) -> Self {
        self.config.recv_buffer_size = n;
        self
    }

    /// Set the per-port outbound queue depth.
    pub fn send_queue_depth(mut self, n: usize) -> Self {
        self.config.send_queue_depth = n;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_sq() {
        let mut config = Config::default();
        config.sq_entries = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_ports() {
        let mut config = Config::default();
        config.max_ports = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_applies_values() {
        let config = ConfigBuilder::new()
            .sq_entries(64)
            .max_ports(8)
            .send_queue_depth(16)
            .build()
            .expect("invalid config");
        assert_eq!(config.sq_entries, 64);
        assert_eq!(config.max_ports, 8);
        assert_eq!(config.send_queue_depth, 16);
    }
}
