// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use proxywire::{util::proxy_generic_tokio_streams, ArcDialer};
use tracing_futures::Instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectArgs {
  pub target: String,
}

/// Pipes standard input and output through a single connection to the target
pub async fn connect_main(dialer: ArcDialer, args: ConnectArgs) -> Result<()> {
  let span = tracing::info_span!("connect", target = %args.target);
  async move {
    let stream = dialer
      .dial("tcp", &args.target)
      .await
      .with_context(|| format!("Failed connecting to {}", args.target))?;
    tracing::debug!("Connected");
    let (mut remote_recv, mut remote_send) = tokio::io::split(stream);
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let (sent, received) = proxy_generic_tokio_streams(
      (&mut stdout, &mut stdin),
      (&mut remote_send, &mut remote_recv),
    )
    .await
    .context("Connection failed while relaying")?;
    tracing::debug!(sent, received, "Connection closed");
    Ok(())
  }
  .instrument(span)
  .await
}
