use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::{
    error::Error,
    identity::{Location, PeerId},
    metrics::{MetricsSink, TracingMetrics},
    registry::TrackerRegistry,
};

#[cfg(feature = "tracker")]
use crate::tracker::topology::{BalancedTopology, TopologyStrategy};

/// Loopback, ephemeral port.
pub fn local_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

/// Knobs shared by control and data links.
#[derive(TypedBuilder, Clone, Debug)]
pub struct TransportSettings {
    /// Upper bound on connecting plus the Hello/Welcome exchange.
    #[builder(default = Duration::from_secs(10))]
    pub handshake_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub keep_alive_interval: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub idle_timeout: Duration,
    /// Frames with a longer body are rejected before the body is read.
    #[builder(default = 8 * 1024 * 1024)]
    pub max_message_bytes: usize,
    #[builder(default = 1 << 17)]
    pub high_water_mark: usize,
    #[builder(default = 1 << 15)]
    pub low_water_mark: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TransportSettings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.low_water_mark >= self.high_water_mark {
            return Err(Error::InvalidConfig(
                "low water mark must be below the high water mark",
            ));
        }
        if self.max_message_bytes == 0 || self.max_message_bytes > u32::MAX as usize {
            return Err(Error::InvalidConfig(
                "max message size must fit a 32-bit length prefix",
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "tracker")]
#[derive(TypedBuilder, Clone)]
pub struct TrackerConfig {
    #[builder(setter(into))]
    pub id: PeerId,
    #[builder(default = local_addr())]
    pub listen_addr: SocketAddr,
    /// Degree bound D of every overlay.
    #[builder(default = 4)]
    pub max_neighbors_per_node: usize,
    /// How long an overlay without members is kept before it is dropped.
    #[builder(default = Duration::from_secs(60))]
    pub overlay_idle_timeout: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub prune_interval: Duration,
    #[builder(default)]
    pub transport: TransportSettings,
    #[builder(default = Arc::new(BalancedTopology) as Arc<dyn TopologyStrategy>)]
    pub topology: Arc<dyn TopologyStrategy>,
    #[builder(default = Arc::new(TracingMetrics) as Arc<dyn MetricsSink>)]
    pub metrics: Arc<dyn MetricsSink>,
}

#[cfg(feature = "tracker")]
impl TrackerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_neighbors_per_node == 0 {
            return Err(Error::InvalidConfig("max neighbors per node must be positive"));
        }
        self.transport.validate()
    }
}

#[cfg(feature = "node")]
#[derive(TypedBuilder, Clone)]
pub struct NodeConfig {
    #[builder(setter(into))]
    pub id: PeerId,
    #[builder(default = local_addr())]
    pub listen_addr: SocketAddr,
    /// Addresses offered to peers during signalling. Empty means the bound
    /// address of the data endpoint.
    #[builder(default)]
    pub advertised_addrs: Vec<SocketAddr>,
    pub trackers: TrackerRegistry,
    #[builder(default, setter(strip_option))]
    pub location: Option<Location>,
    #[builder(default = Duration::from_secs(15))]
    pub negotiation_timeout: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub request_timeout: Duration,
    #[builder(default = Duration::from_millis(500))]
    pub reconnect_base_delay: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub reconnect_max_delay: Duration,
    /// How long a broadcast message id is remembered for duplicate detection.
    #[builder(default = Duration::from_secs(300))]
    pub duplicate_ttl: Duration,
    #[builder(default)]
    pub transport: TransportSettings,
    #[builder(default = Arc::new(TracingMetrics) as Arc<dyn MetricsSink>)]
    pub metrics: Arc<dyn MetricsSink>,
}

#[cfg(feature = "node")]
impl NodeConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.trackers.is_empty() {
            return Err(Error::InvalidConfig("at least one tracker is required"));
        }
        if self.reconnect_base_delay.is_zero() || self.reconnect_base_delay > self.reconnect_max_delay {
            return Err(Error::InvalidConfig(
                "reconnect base delay must be positive and not above the maximum",
            ));
        }
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TrackerInfo;

    #[test]
    fn transport_defaults_are_valid() {
        let settings = TransportSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.high_water_mark, 131072);
        assert_eq!(settings.low_water_mark, 32768);
    }

    #[test]
    fn water_marks_must_be_ordered() {
        let settings = TransportSettings::builder()
            .high_water_mark(10)
            .low_water_mark(10)
            .build();
        assert!(matches!(settings.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn node_requires_a_tracker() {
        let config = NodeConfig::builder()
            .id("node")
            .trackers(TrackerRegistry::default())
            .build();
        assert!(config.validate().is_err());

        let config = NodeConfig::builder()
            .id("node")
            .trackers(TrackerRegistry::single(TrackerInfo::new("t", local_addr())))
            .build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tracker_rejects_zero_degree() {
        let config = TrackerConfig::builder()
            .id("tracker")
            .max_neighbors_per_node(0)
            .build();
        assert!(config.validate().is_err());
    }
}
