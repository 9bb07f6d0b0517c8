// Control and data protocol layered on top of links: message shapes, request
// correlation, version negotiation and the two ends of the control plane.

pub mod messages;
pub mod requests;
pub mod version;

#[cfg(feature = "node")]
pub mod control_client;
#[cfg(feature = "node")]
pub mod node_to_node;
#[cfg(feature = "tracker")]
pub mod tracker_server;
