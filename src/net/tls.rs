use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};

use crate::{config::TransportSettings, error::Error};

use super::SERVER_NAME;

/// Generates a throwaway certificate for this process.
pub fn self_signed() -> Result<(Certificate, PrivateKey), Error> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
    let der = cert.serialize_der()?;
    let key = cert.serialize_private_key_der();
    Ok((Certificate(der), PrivateKey(key)))
}

/// Creates an endpoint that accepts links on `addr` and can dial out.
pub fn server_endpoint(
    addr: SocketAddr,
    settings: &TransportSettings,
) -> Result<quinn::Endpoint, Error> {
    let (cert, key) = self_signed()?;
    let transport = transport_config(settings)?;

    let mut server_config = quinn::ServerConfig::with_single_cert(vec![cert], key)?;
    server_config.transport_config(transport.clone());

    let mut endpoint = quinn::Endpoint::server(server_config, addr)?;
    endpoint.set_default_client_config(client_config(transport));
    Ok(endpoint)
}

/// Creates an endpoint that only dials out.
pub fn client_endpoint(settings: &TransportSettings) -> Result<quinn::Endpoint, Error> {
    let transport = transport_config(settings)?;
    let mut endpoint = quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    endpoint.set_default_client_config(client_config(transport));
    Ok(endpoint)
}

// shared transport configuration for the server and client sides: the default
// config with the BBR congestion controller and keep-alives enabled
fn transport_config(settings: &TransportSettings) -> Result<Arc<quinn::TransportConfig>, Error> {
    let mut transport = quinn::TransportConfig::default();
    let bbr_config = quinn::congestion::BbrConfig::default();
    transport.congestion_controller_factory(Arc::new(bbr_config));
    transport.keep_alive_interval(Some(settings.keep_alive_interval));
    let idle_timeout = quinn::IdleTimeout::try_from(settings.idle_timeout)
        .map_err(|_| Error::InvalidConfig("idle timeout is out of range"))?;
    transport.max_idle_timeout(Some(idle_timeout));
    Ok(Arc::new(transport))
}

fn client_config(transport: Arc<quinn::TransportConfig>) -> quinn::ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport);
    config
}

/// Peers run with self-signed certificates; TLS only provides transport
/// encryption here.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
