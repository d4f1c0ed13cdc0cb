// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Adapter delegating dials to an HTTP-POST ("ping/pong") tunneling transport

use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;
use tracing_futures::Instrument;

use super::{
  http_connect::{basic_authorization, read_connect_response},
  tls::{connect_tls, tls_connector},
};
use crate::{
  common::{
    dialer::{ArcDialer, ArcResolver, Auth, Dialer, Network},
    error::DialerError,
  },
  util::{join_host_port, split_host_port, tunnel_stream::WrappedStream},
};

pub const DEFAULT_PING_PATH: &str = "/ping";
pub const DEFAULT_PONG_PATH: &str = "/pong";

/// The transport carrying tunneled connections; external implementations may replace the default
pub trait TunnelTransport: Send + Sync + std::fmt::Debug + 'static {
  fn open<'a>(
    &'a self,
    network: Network,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>>;
}

/// A [`Dialer`] which hands every dial to its [`TunnelTransport`]
#[derive(Debug)]
pub struct HttpTunnel<T: TunnelTransport = PingPongTransport> {
  transport: T,
}

impl<T: TunnelTransport> HttpTunnel<T> {
  pub fn new(transport: T) -> Self {
    Self { transport }
  }

  pub fn transport(&self) -> &T {
    &self.transport
  }
}

impl<T: TunnelTransport> Dialer for HttpTunnel<T> {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>> {
    async move {
      let network: Network = network.parse()?;
      split_host_port(address)?;
      self.transport.open(network, address).await
    }
    .boxed()
  }
}

/// Builds an HTTP tunnel adapter for the tunnel server at `address`, reached with `scheme` (`http` or `https`)
pub fn http_tunnel(
  network: &str,
  scheme: &str,
  address: &str,
  auth: Option<Auth>,
  forward: ArcDialer,
  _resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let (host, port) = split_host_port(address)?;
  let tls = match scheme {
    "http" => None,
    "https" => Some(tls_connector(&[])?),
    other => return Err(DialerError::UnknownScheme(other.to_string())),
  };
  let transport = PingPongTransport {
    network: network.parse()?,
    host: host.to_string(),
    port,
    ping_path: DEFAULT_PING_PATH.to_string(),
    pong_path: DEFAULT_PONG_PATH.to_string(),
    credentials: auth,
    forward,
    tls,
  };
  Ok(Arc::new(HttpTunnel::new(transport)))
}

/// Opens each tunneled connection with a `POST` to the ping path of the tunnel server
///
/// The destination travels in request headers along with the pong path on which
/// the server addresses replies; a `2xx` answer turns the connection into the tunnel.
pub struct PingPongTransport {
  network: Network,
  host: String,
  port: u16,
  ping_path: String,
  pong_path: String,
  credentials: Option<Auth>,
  forward: ArcDialer,
  tls: Option<TlsConnector>,
}

impl PingPongTransport {
  pub fn scheme(&self) -> &'static str {
    if self.tls.is_some() {
      "https"
    } else {
      "http"
    }
  }

  pub fn server_address(&self) -> String {
    join_host_port(&self.host, self.port)
  }

  pub fn ping_path(&self) -> &str {
    &self.ping_path
  }

  pub fn pong_path(&self) -> &str {
    &self.pong_path
  }

  pub fn credentials(&self) -> Option<&Auth> {
    self.credentials.as_ref()
  }

  fn render_ping(&self, network: Network, address: &str) -> String {
    let mut request = format!(
      "POST {ping} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/octet-stream\r\nX-Tunnel-Network: {network}\r\nX-Tunnel-Target: {address}\r\nX-Tunnel-Reply: {pong}\r\n",
      ping = self.ping_path,
      host = self.server_address(),
      network = network,
      address = address,
      pong = self.pong_path,
    );
    if let Some(credentials) = &self.credentials {
      request.push_str("Authorization: ");
      request.push_str(&basic_authorization(credentials));
      request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
  }
}

impl std::fmt::Debug for PingPongTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PingPongTransport")
      .field("scheme", &self.scheme())
      .field("server", &self.server_address())
      .field("ping_path", &self.ping_path)
      .field("pong_path", &self.pong_path)
      .field("credentials", &self.credentials)
      .finish_non_exhaustive()
  }
}

impl TunnelTransport for PingPongTransport {
  fn open<'a>(
    &'a self,
    network: Network,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>> {
    let span = tracing::debug_span!(
      "http_tunnel_open",
      server = %self.server_address(),
      scheme = self.scheme(),
      address
    );
    async move {
      let conn = self
        .forward
        .dial(self.network.as_str(), &self.server_address())
        .await?;
      let conn = match &self.tls {
        Some(connector) => {
          WrappedStream::boxed(connect_tls(connector, &self.host, conn, "HTTP tunnel").await?)
        }
        None => conn,
      };
      let mut conn = BufReader::new(conn);
      let ping = self.render_ping(network, address);
      conn.get_mut().write_all(ping.as_bytes()).await?;
      conn.get_mut().flush().await?;
      read_connect_response(&mut conn, "HTTP tunnel").await?;
      tracing::trace!("HTTP tunnel opened");
      Ok(WrappedStream::boxed(conn))
    }
    .instrument(span)
    .boxed()
  }
}
