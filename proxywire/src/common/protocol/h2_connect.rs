// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! HTTP/2 `CONNECT` proxy dialer
//!
//! Each dial opens a TLS connection to the proxy, negotiates `h2`, and sends a
//! single `CONNECT` stream whose DATA frames carry the tunneled bytes.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use h2::{RecvStream, SendStream};
use std::{
  io,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsConnector;
use tracing_futures::Instrument;

use super::{
  http_connect::basic_authorization,
  tls::{connect_tls, tls_connector},
};
use crate::{
  common::{
    dialer::{ArcDialer, Auth, Dialer, Network},
    error::DialerError,
  },
  util::{split_host_port, tunnel_stream::WrappedStream, ALPN_H2},
};

const PROXY_NAME: &str = "HTTP/2";

pub struct Http2Connect {
  proxy_network: Network,
  proxy_address: String,
  proxy_host: String,
  authorization: Option<String>,
  forward: ArcDialer,
  tls: TlsConnector,
}

impl std::fmt::Debug for Http2Connect {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Http2Connect")
      .field("proxy_address", &self.proxy_address)
      .field("authenticated", &self.authorization.is_some())
      .finish_non_exhaustive()
  }
}

/// Builds an HTTP/2 `CONNECT` dialer for the TLS proxy at `address`
pub fn http2(
  network: &str,
  address: &str,
  auth: Option<Auth>,
  forward: ArcDialer,
) -> Result<ArcDialer, DialerError> {
  let (host, _) = split_host_port(address)?;
  Ok(Arc::new(Http2Connect {
    proxy_network: network.parse()?,
    proxy_address: address.to_string(),
    proxy_host: host.to_string(),
    authorization: auth.as_ref().map(basic_authorization),
    forward,
    tls: tls_connector(&[ALPN_H2])?,
  }))
}

impl Dialer for Http2Connect {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>> {
    let span = tracing::debug_span!("h2_connect_dial", proxy = %self.proxy_address, address);
    async move {
      network.parse::<Network>()?;
      split_host_port(address)?;
      let conn = self
        .forward
        .dial(self.proxy_network.as_str(), &self.proxy_address)
        .await?;
      let tls = connect_tls(&self.tls, &self.proxy_host, conn, PROXY_NAME).await?;
      if tls.get_ref().1.alpn_protocol() != Some(ALPN_H2) {
        return Err(DialerError::ProxyRefused {
          proxy: PROXY_NAME,
          reason: String::from("proxy did not negotiate h2"),
        });
      }
      let (send_request, connection) = h2::client::handshake(tls)
        .await
        .map_err(|e| DialerError::protocol(PROXY_NAME, e))?;
      tokio::spawn(
        async move {
          if let Err(e) = connection.await {
            tracing::debug!(error = %e, "HTTP/2 proxy connection ended with error");
          }
        }
        .in_current_span(),
      );

      let mut request = http::Request::builder()
        .method(http::Method::CONNECT)
        .uri(address);
      if let Some(authorization) = &self.authorization {
        request = request.header(http::header::PROXY_AUTHORIZATION, authorization.as_str());
      }
      let request = request
        .body(())
        .map_err(|e| DialerError::protocol(PROXY_NAME, e))?;
      let mut send_request = send_request
        .ready()
        .await
        .map_err(|e| DialerError::protocol(PROXY_NAME, e))?;
      let (response, send) = send_request
        .send_request(request, false)
        .map_err(|e| DialerError::protocol(PROXY_NAME, e))?;
      let response = response
        .await
        .map_err(|e| DialerError::protocol(PROXY_NAME, e))?;
      if !response.status().is_success() {
        return Err(DialerError::ProxyRefused {
          proxy: PROXY_NAME,
          reason: format!("CONNECT answered with {}", response.status()),
        });
      }
      tracing::trace!("HTTP/2 CONNECT stream established");
      Ok(WrappedStream::boxed(H2Tunnel::new(send, response.into_body())))
    }
    .instrument(span)
    .boxed()
  }
}

/// Adapts an HTTP/2 stream pair to a byte stream, returning flow-control capacity as data is read
struct H2Tunnel {
  send: SendStream<Bytes>,
  recv: RecvStream,
  pending: Bytes,
  send_closed: bool,
}

impl H2Tunnel {
  fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
    Self {
      send,
      recv,
      pending: Bytes::new(),
      send_closed: false,
    }
  }
}

fn h2_io_error(e: h2::Error) -> io::Error {
  if e.is_io() {
    e.into_io().unwrap_or_else(|| io::Error::from(io::ErrorKind::Other))
  } else {
    io::Error::new(io::ErrorKind::Other, e)
  }
}

impl AsyncRead for H2Tunnel {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    loop {
      if !this.pending.is_empty() {
        let n = std::cmp::min(buf.remaining(), this.pending.len());
        let chunk = this.pending.split_to(n);
        buf.put_slice(&chunk);
        return Poll::Ready(Ok(()));
      }
      match futures::ready!(this.recv.poll_data(cx)) {
        Some(Ok(data)) => {
          let _ = this.recv.flow_control().release_capacity(data.len());
          this.pending = data;
        }
        Some(Err(e)) => return Poll::Ready(Err(h2_io_error(e))),
        None => return Poll::Ready(Ok(())),
      }
    }
  }
}

impl AsyncWrite for H2Tunnel {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, io::Error>> {
    let this = self.get_mut();
    if buf.is_empty() {
      return Poll::Ready(Ok(0));
    }
    if this.send_closed {
      return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
    }
    this.send.reserve_capacity(buf.len());
    loop {
      match futures::ready!(this.send.poll_capacity(cx)) {
        Some(Ok(0)) => continue,
        Some(Ok(capacity)) => {
          let n = std::cmp::min(capacity, buf.len());
          this
            .send
            .send_data(Bytes::copy_from_slice(&buf[..n]), false)
            .map_err(h2_io_error)?;
          return Poll::Ready(Ok(n));
        }
        Some(Err(e)) => return Poll::Ready(Err(h2_io_error(e))),
        None => return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe))),
      }
    }
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    let this = self.get_mut();
    if !this.send_closed {
      this.send_closed = true;
      this
        .send
        .send_data(Bytes::new(), true)
        .map_err(h2_io_error)?;
    }
    Poll::Ready(Ok(()))
  }
}

#[cfg(test)]
mod tests {
  use super::http2;
  use crate::common::{error::DialerError, protocol::socks::tests::PipeDialer};

  #[test]
  fn http2_requires_proxy_port() {
    let err = http2("tcp", "proxy.example", None, PipeDialer::with_peer(tokio::io::duplex(8).0))
      .unwrap_err();
    assert!(matches!(err, DialerError::InvalidAddress { .. }));
  }

  #[tokio::test]
  async fn http2_rejects_datagram_networks() {
    let dialer = http2(
      "tcp",
      "proxy.example:443",
      None,
      PipeDialer::with_peer(tokio::io::duplex(8).0),
    )
    .unwrap();
    let err = dialer.dial("udp", "example.com:443").await.unwrap_err();
    assert!(matches!(err, DialerError::UnsupportedNetwork(_)));
  }
}
