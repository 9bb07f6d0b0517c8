// QUIC plumbing shared by the control plane (participant <-> tracker) and the
// data plane (participant <-> participant). Both run one bidirectional stream
// per connection, opened by the initiator and used first for the Hello/Welcome
// handshake and afterwards for framed protocol messages.

pub mod link;
pub mod tls;
pub mod wire;

/// Server name presented on every link. Certificates are self-signed, so
/// the peer is identified by the PeerInfo it presents during the handshake.
pub const SERVER_NAME: &str = "streamnet";
