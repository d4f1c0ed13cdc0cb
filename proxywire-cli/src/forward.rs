// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use futures::stream::StreamExt;
use proxywire::{util::proxy_generic_tokio_streams, ArcDialer};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardArgs {
  pub listen: SocketAddr,
  pub target: String,
}

/// Accepts local connections until `stop_accepting` fires, bridging each through its own dial
pub async fn forward_main(
  dialer: ArcDialer,
  args: ForwardArgs,
  stop_accepting: CancellationToken,
) -> Result<()> {
  let listener = TcpListener::bind(args.listen)
    .await
    .with_context(|| format!("Failed binding {}", args.listen))?;
  tracing::info!(listen = %args.listen, target = %args.target, "Forwarding connections");
  let target = Arc::new(args.target);
  tokio_stream::wrappers::TcpListenerStream::new(listener)
    .take_until(stop_accepting.cancelled())
    .for_each_concurrent(None, |accepted| {
      let dialer = Arc::clone(&dialer);
      let target = Arc::clone(&target);
      async move {
        let local = match accepted {
          Ok(local) => local,
          Err(e) => {
            tracing::warn!(error = %e, "Failed accepting connection");
            return;
          }
        };
        let peer = local.peer_addr().ok();
        let span = tracing::debug_span!("forwarded_connection", ?peer, target = %target);
        if let Err(e) = bridge(dialer, local, &target).instrument(span).await {
          tracing::warn!(?peer, error = ?e, "Forwarded connection failed");
        }
      }
    })
    .await;
  tracing::info!("Stopped accepting connections");
  Ok(())
}

async fn bridge(dialer: ArcDialer, local: TcpStream, target: &str) -> Result<()> {
  let remote = dialer
    .dial("tcp", target)
    .await
    .with_context(|| format!("Failed connecting to {}", target))?;
  let (mut local_recv, mut local_send) = tokio::io::split(local);
  let (mut remote_recv, mut remote_send) = tokio::io::split(remote);
  let (sent, received) = proxy_generic_tokio_streams(
    (&mut local_send, &mut local_recv),
    (&mut remote_send, &mut remote_recv),
  )
  .await?;
  tracing::debug!(sent, received, "Forwarded connection closed");
  Ok(())
}

#[cfg(test)]
mod tests {
  use proxywire::Direct;
  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
  };
  use tokio_util::sync::CancellationToken;

  use super::{forward_main, ForwardArgs};

  #[tokio::test]
  async fn forwards_through_dialer() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut conn, _) = echo.accept().await.unwrap();
      let mut buf = [0u8; 5];
      conn.read_exact(&mut buf).await.unwrap();
      conn.write_all(&buf).await.unwrap();
    });

    // Reserve a free port for the forwarder
    let listen = TcpListener::bind("127.0.0.1:0")
      .await
      .unwrap()
      .local_addr()
      .unwrap();
    let stop = CancellationToken::new();
    let forwarder = tokio::spawn(forward_main(
      Direct::shared(),
      ForwardArgs {
        listen,
        target: echo_addr.to_string(),
      },
      stop.clone(),
    ));

    let mut conn = loop {
      match TcpStream::connect(listen).await {
        Ok(conn) => break conn,
        Err(_) => tokio::task::yield_now().await,
      }
    };
    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    stop.cancel();
    drop(conn);
    forwarder.await.unwrap().unwrap();
  }
}
