use tracing::trace;

/// Write-only sink for operational counters and gauges. The overlay never
/// reads back what it records.
pub trait MetricsSink: Send + Sync + 'static {
    fn increment(&self, name: &'static str, by: u64);
    fn gauge(&self, name: &'static str, value: f64);
}

/// Emits every sample as a `trace` event under the `streamnet::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &'static str, by: u64) {
        trace!(target: "streamnet::metrics", metric = name, by, "counter");
    }

    fn gauge(&self, name: &'static str, value: f64) {
        trace!(target: "streamnet::metrics", metric = name, value, "gauge");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _by: u64) {}

    fn gauge(&self, _name: &'static str, _value: f64) {}
}

pub const STATUS_RECEIVED: &str = "tracker.status_received";
pub const STATUS_STALE: &str = "tracker.status_stale";
pub const INSTRUCTIONS_SENT: &str = "tracker.instructions_sent";
pub const RELAYS_FORWARDED: &str = "tracker.relays_forwarded";
pub const UNKNOWN_PEER_ERRORS: &str = "tracker.unknown_peer_errors";
pub const CONNECTED_NODES: &str = "tracker.connected_nodes";
pub const OVERLAYS: &str = "tracker.overlays";

pub const NODE_CONNECTIONS: &str = "node.connections";
pub const NODE_QUEUED_BYTES: &str = "node.queued_bytes";
pub const NODE_BACK_PRESSURE_HIGH: &str = "node.back_pressure_high";
pub const NODE_MESSAGES_RECEIVED: &str = "node.messages_received";
pub const NODE_DUPLICATES: &str = "node.duplicate_messages";
pub const NODE_INSTRUCTIONS_APPLIED: &str = "node.instructions_applied";
