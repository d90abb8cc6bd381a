//! Ring configuration and builder.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RingError, RingResult};

/// Configuration for a ring node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// TCP port for overlay RPCs
    pub rpc_port: u16,

    /// Per-call deadline for overlay RPCs
    pub rpc_timeout: Duration,

    /// Bound on concurrently served RPCs
    pub rpc_workers: usize,

    /// Directed broadcast address probed during bootstrap
    pub broadcast_addr: Ipv4Addr,

    /// UDP port for node-to-node bootstrap probes
    pub broadcast_port: u16,

    /// Multicast group joined for client-to-node probes
    pub multicast_group: Ipv4Addr,

    /// UDP port for client-to-node probes
    pub multicast_port: u16,

    /// How long a bootstrap probe waits for a reply
    pub discovery_timeout: Duration,

    /// Interval between stabilization rounds
    pub stabilize_interval: Duration,

    /// Interval between finger refreshes
    pub fix_fingers_interval: Duration,

    /// Interval between predecessor liveness checks
    pub check_predecessor_interval: Duration,

    /// Interval between status log lines
    pub status_interval: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            rpc_port: 50051,
            rpc_timeout: Duration::from_secs(2),
            rpc_workers: 10,
            broadcast_addr: Ipv4Addr::BROADCAST,
            broadcast_port: 10000,
            multicast_group: Ipv4Addr::new(224, 0, 0, 1),
            multicast_port: 5000,
            discovery_timeout: Duration::from_secs(5),
            stabilize_interval: Duration::from_secs(5),
            fix_fingers_interval: Duration::from_secs(5),
            check_predecessor_interval: Duration::from_secs(2),
            status_interval: Duration::from_secs(10),
        }
    }
}

impl RingConfig {
    /// Create a new builder for ring configuration.
    #[must_use]
    pub fn builder() -> RingConfigBuilder {
        RingConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> RingResult<()> {
        if self.rpc_port == 0 || self.broadcast_port == 0 || self.multicast_port == 0 {
            return Err(RingError::Config("ports must be non-zero".into()));
        }

        if !self.multicast_group.is_multicast() {
            return Err(RingError::Config(format!(
                "{} is not a multicast group",
                self.multicast_group
            )));
        }

        if self.rpc_workers == 0 {
            return Err(RingError::Config("rpc_workers must be at least 1".into()));
        }

        for (name, interval) in [
            ("rpc_timeout", self.rpc_timeout),
            ("stabilize_interval", self.stabilize_interval),
            ("fix_fingers_interval", self.fix_fingers_interval),
            ("check_predecessor_interval", self.check_predecessor_interval),
        ] {
            if interval.is_zero() {
                return Err(RingError::Config(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }
}

/// Builder for ring configuration.
#[derive(Debug, Default)]
pub struct RingConfigBuilder {
    config: RingConfig,
}

impl RingConfigBuilder {
    /// Set the overlay RPC port.
    #[must_use]
    pub fn rpc_port(mut self, port: u16) -> Self {
        self.config.rpc_port = port;
        self
    }

    /// Set the per-call RPC deadline.
    #[must_use]
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    /// Set the broadcast probe address and port.
    #[must_use]
    pub fn broadcast(mut self, addr: Ipv4Addr, port: u16) -> Self {
        self.config.broadcast_addr = addr;
        self.config.broadcast_port = port;
        self
    }

    /// Set the multicast group and port.
    #[must_use]
    pub fn multicast(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.config.multicast_group = group;
        self.config.multicast_port = port;
        self
    }

    /// Set the bootstrap probe timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.discovery_timeout = timeout;
        self
    }

    /// Set all three maintenance intervals at once.
    #[must_use]
    pub fn maintenance_intervals(
        mut self,
        stabilize: Duration,
        fix_fingers: Duration,
        check_predecessor: Duration,
    ) -> Self {
        self.config.stabilize_interval = stabilize;
        self.config.fix_fingers_interval = fix_fingers;
        self.config.check_predecessor_interval = check_predecessor;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> RingResult<RingConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
