// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::{
  common::error::{ConfigurationError, DialerError},
  util::tunnel_stream::WrappedStream,
};

/// Builds a client TLS connector trusting the webpki root set, offering the given ALPN protocols
pub fn tls_connector(alpn_protocols: &[&[u8]]) -> Result<TlsConnector, ConfigurationError> {
  let mut roots = rustls::RootCertStore::empty();
  roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
  let mut config =
    rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
      .with_safe_default_protocol_versions()
      .map_err(|e| ConfigurationError::Tls(e.to_string()))?
      .with_root_certificates(roots)
      .with_no_client_auth();
  config.alpn_protocols = alpn_protocols.iter().map(|p| p.to_vec()).collect();
  Ok(TlsConnector::from(Arc::new(config)))
}

/// Wraps an established proxy connection in TLS, verifying the proxy's certificate against `host`
pub async fn connect_tls(
  connector: &TlsConnector,
  host: &str,
  stream: WrappedStream,
  proxy: &'static str,
) -> Result<TlsStream<WrappedStream>, DialerError> {
  let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
    DialerError::InvalidAddress {
      address: host.to_string(),
      reason: "not a valid TLS server name",
    }
  })?;
  connector
    .connect(server_name, stream)
    .await
    .map_err(|e| DialerError::protocol(proxy, e))
}
