// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::error::DialerError;

pub mod cancellation;
pub mod dropkick;
pub mod tunnel_stream;
pub mod validators;

/// ALPN protocol name negotiated with HTTP/2 proxies
pub const ALPN_H2: &[u8] = b"h2";

/// Splits a `host:port` or `[ipv6]:port` address into its host and numeric port
///
/// Brackets are removed from IPv6 literals. Addresses lacking a port, carrying
/// more than one unbracketed colon, or with a non-numeric port are rejected.
pub fn split_host_port(address: &str) -> Result<(&str, u16), DialerError> {
  let invalid = |reason: &'static str| DialerError::InvalidAddress {
    address: address.to_string(),
    reason,
  };
  let (host, port) = if let Some(rest) = address.strip_prefix('[') {
    let (host, after) = rest
      .split_once(']')
      .ok_or_else(|| invalid("missing ']' in address"))?;
    let port = after
      .strip_prefix(':')
      .ok_or_else(|| invalid("missing port in address"))?;
    (host, port)
  } else {
    let (host, port) = address
      .rsplit_once(':')
      .ok_or_else(|| invalid("missing port in address"))?;
    if host.contains(':') {
      return Err(invalid("too many colons in address"));
    }
    (host, port)
  };
  if port.is_empty() {
    return Err(invalid("missing port in address"));
  }
  let port = port
    .parse::<u16>()
    .map_err(|_| invalid("invalid port in address"))?;
  Ok((host, port))
}

/// Joins a host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
  if host.contains(':') && !host.starts_with('[') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}

#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn proxy_generic_tokio_streams<
  SenderA: AsyncWrite + Unpin,
  ReaderA: AsyncRead + Unpin,
  SenderB: AsyncWrite + Unpin,
  ReaderB: AsyncRead + Unpin,
>(
  a: (&mut SenderA, &mut ReaderA),
  b: (&mut SenderB, &mut ReaderB),
) -> Result<(u64, u64), std::io::Error> {
  const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;
  let (sender_a, reader_a) = a;
  let (sender_b, reader_b) = b;
  let mut reader_a = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_a);
  let mut reader_b = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_b);
  let proxy_a2b = async {
    let copied = tokio::io::copy_buf(&mut reader_a, sender_b).await?;
    tokio::io::AsyncWriteExt::shutdown(sender_b).await?;
    Ok::<_, std::io::Error>(copied)
  };
  let proxy_b2a = async {
    let copied = tokio::io::copy_buf(&mut reader_b, sender_a).await?;
    tokio::io::AsyncWriteExt::shutdown(sender_a).await?;
    Ok::<_, std::io::Error>(copied)
  };
  tracing::trace!("polling");
  match futures::future::try_join(proxy_a2b, proxy_b2a).await {
    Ok((a_to_b, b_to_a)) => Ok((a_to_b, b_to_a)),
    Err(e) => {
      tracing::debug!(error = ?e, "Proxy connection copy with error {:#?}", e);
      Err(e)
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::common::error::DialerError;

  use super::{join_host_port, split_host_port};

  #[test]
  fn split_plain_host() {
    assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com", 443));
  }

  #[test]
  fn split_bracketed_ipv6() {
    assert_eq!(split_host_port("[::1]:22").unwrap(), ("::1", 22));
  }

  #[test]
  fn split_rejects_missing_port() {
    for address in ["example.com", "example.com:", "[::1]", "[::1]:"] {
      assert!(
        matches!(
          split_host_port(address),
          Err(DialerError::InvalidAddress { .. })
        ),
        "{} must be rejected",
        address
      );
    }
  }

  #[test]
  fn split_rejects_bare_ipv6() {
    assert!(split_host_port("::1:22").is_err());
  }

  #[test]
  fn split_rejects_non_numeric_port() {
    assert!(split_host_port("example.com:https").is_err());
  }

  #[test]
  fn join_brackets_ipv6() {
    assert_eq!(join_host_port("::1", 80), "[::1]:80");
    assert_eq!(join_host_port("example.com", 80), "example.com:80");
  }

  #[tokio::test]
  async fn proxy_streams_copies_both_directions() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let (mut client, left) = tokio::io::duplex(64);
    let (right, mut server) = tokio::io::duplex(64);
    let bridge = tokio::spawn(async move {
      let (mut lr, mut lw) = tokio::io::split(left);
      let (mut rr, mut rw) = tokio::io::split(right);
      super::proxy_generic_tokio_streams((&mut lw, &mut lr), (&mut rw, &mut rr)).await
    });
    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();
    let mut buf = Vec::new();
    server.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"ping");
    server.write_all(b"pong").await.unwrap();
    server.shutdown().await.unwrap();
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"pong");
    assert_eq!(bridge.await.unwrap().unwrap(), (4, 4));
  }
}
