// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! HTTP/1.1 `CONNECT` proxy dialers, in cleartext and over TLS

use base64::Engine;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;
use tracing_futures::Instrument;

use super::tls::{connect_tls, tls_connector};
use crate::{
  common::{
    dialer::{ArcDialer, Auth, Dialer, Network},
    error::DialerError,
  },
  util::{split_host_port, tunnel_stream::WrappedStream},
};

const MAX_RESPONSE_HEADER_BYTES: usize = 16 * 1024;

/// A `CONNECT` proxy client; when `tls` is present the proxy itself is reached over TLS
pub struct HttpConnect {
  proxy_network: Network,
  proxy_address: String,
  proxy_host: String,
  authorization: Option<String>,
  forward: ArcDialer,
  tls: Option<TlsConnector>,
}

impl std::fmt::Debug for HttpConnect {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpConnect")
      .field("proxy_address", &self.proxy_address)
      .field("tls", &self.tls.is_some())
      .field("authenticated", &self.authorization.is_some())
      .finish_non_exhaustive()
  }
}

/// Builds a cleartext HTTP `CONNECT` dialer
pub fn http1(
  network: &str,
  address: &str,
  auth: Option<Auth>,
  forward: ArcDialer,
) -> Result<ArcDialer, DialerError> {
  Ok(Arc::new(HttpConnect::new(network, address, auth, forward, None)?))
}

/// Builds an HTTP `CONNECT` dialer which speaks TLS to the proxy
pub fn https(
  network: &str,
  address: &str,
  auth: Option<Auth>,
  forward: ArcDialer,
) -> Result<ArcDialer, DialerError> {
  let connector = tls_connector(&[])?;
  Ok(Arc::new(HttpConnect::new(
    network,
    address,
    auth,
    forward,
    Some(connector),
  )?))
}

impl HttpConnect {
  fn new(
    network: &str,
    address: &str,
    auth: Option<Auth>,
    forward: ArcDialer,
    tls: Option<TlsConnector>,
  ) -> Result<Self, DialerError> {
    let (host, _) = split_host_port(address)?;
    Ok(Self {
      proxy_network: network.parse()?,
      proxy_address: address.to_string(),
      proxy_host: host.to_string(),
      authorization: auth.as_ref().map(basic_authorization),
      forward,
      tls,
    })
  }

  fn proxy_name(&self) -> &'static str {
    if self.tls.is_some() {
      "HTTPS"
    } else {
      "HTTP"
    }
  }
}

impl Dialer for HttpConnect {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>> {
    let span = tracing::debug_span!(
      "http_connect_dial",
      proxy = %self.proxy_address,
      tls = self.tls.is_some(),
      address
    );
    async move {
      network.parse::<Network>()?;
      split_host_port(address)?;
      let conn = self
        .forward
        .dial(self.proxy_network.as_str(), &self.proxy_address)
        .await?;
      let conn = match &self.tls {
        Some(connector) => WrappedStream::boxed(
          connect_tls(connector, &self.proxy_host, conn, self.proxy_name()).await?,
        ),
        None => conn,
      };
      let mut conn = BufReader::new(conn);
      write_connect_request(conn.get_mut(), address, self.authorization.as_deref()).await?;
      read_connect_response(&mut conn, self.proxy_name()).await?;
      tracing::trace!("CONNECT tunnel established");
      // The reader may already hold tunneled bytes; it stays in the stream to preserve them
      Ok(WrappedStream::boxed(conn))
    }
    .instrument(span)
    .boxed()
  }
}

/// Renders the value of a `Basic` authorization header
pub(crate) fn basic_authorization(auth: &Auth) -> String {
  let credentials = format!("{}:{}", auth.user, auth.password_or_empty());
  format!(
    "Basic {}",
    base64::engine::general_purpose::STANDARD.encode(credentials)
  )
}

async fn write_connect_request<W: AsyncWrite + Unpin>(
  writer: &mut W,
  address: &str,
  authorization: Option<&str>,
) -> Result<(), DialerError> {
  let mut request = format!(
    "CONNECT {address} HTTP/1.1\r\nHost: {address}\r\n",
    address = address
  );
  if let Some(authorization) = authorization {
    request.push_str("Proxy-Authorization: ");
    request.push_str(authorization);
    request.push_str("\r\n");
  }
  request.push_str("\r\n");
  writer.write_all(request.as_bytes()).await?;
  writer.flush().await?;
  Ok(())
}

/// Reads a response head, returning the status code if it is successful
///
/// Headers are consumed and discarded; only the status line matters for a tunnel.
pub(crate) async fn read_connect_response<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  proxy: &'static str,
) -> Result<u16, DialerError> {
  let mut consumed = 0usize;
  let mut status_line = String::new();
  consumed += reader.read_line(&mut status_line).await?;
  let status = parse_status_line(&status_line).ok_or_else(|| DialerError::ProxyRefused {
    proxy,
    reason: format!("malformed status line {:?}", status_line.trim_end()),
  })?;
  loop {
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
      return Err(DialerError::ProxyRefused {
        proxy,
        reason: String::from("connection closed while reading response headers"),
      });
    }
    consumed += read;
    if consumed > MAX_RESPONSE_HEADER_BYTES {
      return Err(DialerError::ProxyRefused {
        proxy,
        reason: String::from("response headers too large"),
      });
    }
    if line == "\r\n" || line == "\n" {
      break;
    }
  }
  if !(200..300).contains(&status) {
    return Err(DialerError::ProxyRefused {
      proxy,
      reason: status_line.trim_end().to_string(),
    });
  }
  Ok(status)
}

fn parse_status_line(line: &str) -> Option<u16> {
  let mut parts = line.split_whitespace();
  let version = parts.next()?;
  if !version.starts_with("HTTP/") {
    return None;
  }
  parts.next()?.parse::<u16>().ok()
}
