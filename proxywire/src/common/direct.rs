// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpStream;
use tracing_futures::Instrument;

use super::{
  dialer::{ArcDialer, ArcResolver, Dialer, Network, SystemResolver},
  error::DialerError,
};
use crate::util::{split_host_port, tunnel_stream::WrappedStream};

/// Connects directly to the destination without any proxy
#[derive(Debug, Clone)]
pub struct Direct {
  resolver: ArcResolver,
}

impl Direct {
  pub fn new(resolver: ArcResolver) -> Self {
    Self { resolver }
  }

  pub fn shared() -> ArcDialer {
    Arc::new(Self::default())
  }
}

impl Default for Direct {
  fn default() -> Self {
    Self::new(SystemResolver::shared())
  }
}

impl Dialer for Direct {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>> {
    let span = tracing::debug_span!("direct_dial", network, address);
    async move {
      let network: Network = network.parse()?;
      let (host, port) = split_host_port(address)?;
      let addrs: Vec<SocketAddr> = self
        .resolver
        .lookup_host(host)
        .await?
        .into_iter()
        .filter(|ip| network.admits(ip))
        .map(|ip| SocketAddr::new(ip, port))
        .collect();
      if addrs.is_empty() {
        return Err(DialerError::Resolution {
          host: host.to_string(),
          reason: format!("no {} addresses found", network),
        });
      }
      let mut last_error = None;
      for addr in addrs {
        match TcpStream::connect(addr).await {
          Ok(stream) => {
            let _ = stream.set_nodelay(true);
            tracing::trace!(%addr, "connected");
            return Ok(WrappedStream::Tcp(stream));
          }
          Err(e) => {
            tracing::debug!(%addr, error = %e, "connect attempt failed");
            last_error = Some(e);
          }
        }
      }
      Err(
        last_error
          .map(DialerError::from)
          .unwrap_or_else(|| DialerError::Resolution {
            host: host.to_string(),
            reason: String::from("no addresses attempted"),
          }),
      )
    }
    .instrument(span)
    .boxed()
  }
}
