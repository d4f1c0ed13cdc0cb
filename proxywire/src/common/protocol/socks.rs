// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! SOCKS4, SOCKS4a, and SOCKS5 client dialers

use futures::future::{BoxFuture, FutureExt};
use std::{
  net::{IpAddr, Ipv4Addr},
  sync::Arc,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing_futures::Instrument;

use crate::{
  common::{
    dialer::{ArcDialer, ArcResolver, Auth, Dialer, Network},
    error::{ConfigurationError, DialerError},
  },
  util::{split_host_port, tunnel_stream::WrappedStream},
};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_AUTH_UNACCEPTABLE: u8 = 0xFF;
const SOCKS5_PASSWORD_VERSION: u8 = 0x01;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_CMD_CONNECT: u8 = 0x01;
const SOCKS4_GRANTED: u8 = 0x5A;

/// A SOCKS5 proxy client, reached through a forwarding dialer
#[derive(Debug)]
pub struct Socks5 {
  proxy_network: Network,
  proxy_address: String,
  auth: Option<Auth>,
  forward: ArcDialer,
  resolver: ArcResolver,
}

/// Builds a SOCKS5 dialer for the proxy at `address`
///
/// Destination hostnames are resolved by the proxy, except for `tcp4`/`tcp6`
/// dials, which resolve locally so the requested address family is honored.
pub fn socks5(
  network: &str,
  address: &str,
  auth: Option<Auth>,
  forward: ArcDialer,
  resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  split_host_port(address)?;
  if let Some(auth) = auth.as_ref() {
    credential_lengths(auth)?;
  }
  Ok(Arc::new(Socks5 {
    proxy_network: network.parse()?,
    proxy_address: address.to_string(),
    auth,
    forward,
    resolver,
  }))
}

impl Dialer for Socks5 {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>> {
    let span = tracing::debug_span!("socks5_dial", proxy = %self.proxy_address, address);
    async move {
      let network: Network = network.parse()?;
      let (host, port) = split_host_port(address)?;
      let target = match (network, host.parse::<IpAddr>()) {
        (_, Ok(ip)) => SocksTarget::Ip(ip),
        (Network::Tcp, Err(_)) => SocksTarget::Domain(host),
        (family, Err(_)) => {
          let ip = self
            .resolver
            .lookup_host(host)
            .await?
            .into_iter()
            .find(|ip| family.admits(ip))
            .ok_or_else(|| DialerError::Resolution {
              host: host.to_string(),
              reason: format!("no {} addresses found", family),
            })?;
          SocksTarget::Ip(ip)
        }
      };
      let mut conn = self
        .forward
        .dial(self.proxy_network.as_str(), &self.proxy_address)
        .await?;
      socks5_handshake(&mut conn, self.auth.as_ref(), &target, port).await?;
      tracing::trace!("SOCKS5 tunnel established");
      Ok(conn)
    }
    .instrument(span)
    .boxed()
  }
}

/// RFC 1929 length prefixes for the username and password
fn credential_lengths(auth: &Auth) -> Result<(u8, u8), ConfigurationError> {
  let length = |name: &'static str, value: &str| {
    u8::try_from(value.len()).map_err(|_| ConfigurationError::InvalidSetting {
      name,
      reason: "must be at most 255 bytes",
    })
  };
  Ok((
    length("SOCKS5 username", &auth.user)?,
    length("SOCKS5 password", auth.password_or_empty())?,
  ))
}

enum SocksTarget<'a> {
  Ip(IpAddr),
  Domain(&'a str),
}

async fn socks5_handshake<S>(
  stream: &mut S,
  auth: Option<&Auth>,
  target: &SocksTarget<'_>,
  port: u16,
) -> Result<(), DialerError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let lengths = auth.map(credential_lengths).transpose()?;
  let greeting: &[u8] = match auth {
    Some(_) => &[SOCKS5_VERSION, 2, SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD],
    None => &[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE],
  };
  stream.write_all(greeting).await?;
  let mut choice = [0u8; 2];
  stream.read_exact(&mut choice).await?;
  if choice[0] != SOCKS5_VERSION {
    return Err(refused("SOCKS5", format!("unexpected version {}", choice[0])));
  }
  match (choice[1], auth) {
    (SOCKS5_AUTH_NONE, _) => {}
    (SOCKS5_AUTH_PASSWORD, Some(auth)) => {
      let password = auth.password_or_empty();
      let (user_len, password_len) = lengths.unwrap_or_default();
      let mut request = Vec::with_capacity(3 + auth.user.len() + password.len());
      request.push(SOCKS5_PASSWORD_VERSION);
      request.push(user_len);
      request.extend_from_slice(auth.user.as_bytes());
      request.push(password_len);
      request.extend_from_slice(password.as_bytes());
      stream.write_all(&request).await?;
      let mut status = [0u8; 2];
      stream.read_exact(&mut status).await?;
      if status[1] != 0 {
        return Err(refused("SOCKS5", String::from("username/password rejected")));
      }
    }
    (SOCKS5_AUTH_UNACCEPTABLE, _) => {
      return Err(refused(
        "SOCKS5",
        String::from("no acceptable authentication methods"),
      ))
    }
    (other, _) => {
      return Err(refused(
        "SOCKS5",
        format!("unsupported authentication method {}", other),
      ))
    }
  }

  let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0];
  match target {
    SocksTarget::Ip(IpAddr::V4(ip)) => {
      request.push(SOCKS5_ATYP_IPV4);
      request.extend_from_slice(&ip.octets());
    }
    SocksTarget::Ip(IpAddr::V6(ip)) => {
      request.push(SOCKS5_ATYP_IPV6);
      request.extend_from_slice(&ip.octets());
    }
    SocksTarget::Domain(name) => {
      if name.len() > 255 {
        return Err(DialerError::InvalidAddress {
          address: name.to_string(),
          reason: "SOCKS5 hostnames are limited to 255 bytes",
        });
      }
      request.push(SOCKS5_ATYP_DOMAIN);
      request.push(name.len() as u8);
      request.extend_from_slice(name.as_bytes());
    }
  }
  request.extend_from_slice(&port.to_be_bytes());
  stream.write_all(&request).await?;

  let mut reply = [0u8; 4];
  stream.read_exact(&mut reply).await?;
  if reply[1] != 0 {
    return Err(refused("SOCKS5", socks5_reply_reason(reply[1]).to_string()));
  }
  // Bound address is unused, but must be drained before the tunnel carries data
  let bound_len = match reply[3] {
    SOCKS5_ATYP_IPV4 => 4,
    SOCKS5_ATYP_IPV6 => 16,
    SOCKS5_ATYP_DOMAIN => {
      let mut len = [0u8; 1];
      stream.read_exact(&mut len).await?;
      len[0] as usize
    }
    other => {
      return Err(refused(
        "SOCKS5",
        format!("unknown bound address type {}", other),
      ))
    }
  };
  let mut bound = vec![0u8; bound_len + 2];
  stream.read_exact(&mut bound).await?;
  Ok(())
}

fn socks5_reply_reason(code: u8) -> &'static str {
  match code {
    0x01 => "general SOCKS server failure",
    0x02 => "connection not allowed by ruleset",
    0x03 => "network unreachable",
    0x04 => "host unreachable",
    0x05 => "connection refused",
    0x06 => "TTL expired",
    0x07 => "command not supported",
    0x08 => "address type not supported",
    _ => "unknown failure",
  }
}

/// A SOCKS4 or SOCKS4a proxy client
#[derive(Debug)]
pub struct Socks4 {
  proxy_network: Network,
  proxy_address: String,
  user_id: String,
  remote_resolution: bool,
  forward: ArcDialer,
  resolver: ArcResolver,
}

/// Builds a SOCKS4 dialer; `remote_resolution` selects the SOCKS4a hostname extension
///
/// Plain SOCKS4 can only carry IPv4 destinations, so names are resolved locally.
pub fn socks4(
  network: &str,
  address: &str,
  auth: Option<Auth>,
  remote_resolution: bool,
  forward: ArcDialer,
  resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  split_host_port(address)?;
  Ok(Arc::new(Socks4 {
    proxy_network: network.parse()?,
    proxy_address: address.to_string(),
    user_id: auth.map(|a| a.user).unwrap_or_default(),
    remote_resolution,
    forward,
    resolver,
  }))
}

impl Socks4 {
  fn protocol_name(&self) -> &'static str {
    if self.remote_resolution {
      "SOCKS4a"
    } else {
      "SOCKS4"
    }
  }
}

impl Dialer for Socks4 {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>> {
    let span = tracing::debug_span!(
      "socks4_dial",
      proxy = %self.proxy_address,
      remote_resolution = self.remote_resolution,
      address
    );
    async move {
      let network: Network = network.parse()?;
      if network == Network::Tcp6 {
        return Err(DialerError::UnsupportedNetwork(network.to_string()));
      }
      let (host, port) = split_host_port(address)?;
      let mut request = vec![SOCKS4_VERSION, SOCKS4_CMD_CONNECT];
      request.extend_from_slice(&port.to_be_bytes());
      match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
          request.extend_from_slice(&ip.octets());
          request.extend_from_slice(self.user_id.as_bytes());
          request.push(0);
        }
        Ok(IpAddr::V6(_)) => {
          return Err(DialerError::InvalidAddress {
            address: address.to_string(),
            reason: "SOCKS4 cannot carry IPv6 destinations",
          })
        }
        Err(_) if self.remote_resolution => {
          // 0.0.0.x with a nonzero x signals that a hostname follows the user id
          request.extend_from_slice(&Ipv4Addr::new(0, 0, 0, 1).octets());
          request.extend_from_slice(self.user_id.as_bytes());
          request.push(0);
          request.extend_from_slice(host.as_bytes());
          request.push(0);
        }
        Err(_) => {
          let ip = self
            .resolver
            .lookup_host(host)
            .await?
            .into_iter()
            .find_map(|ip| match ip {
              IpAddr::V4(v4) => Some(v4),
              IpAddr::V6(_) => None,
            })
            .ok_or_else(|| DialerError::Resolution {
              host: host.to_string(),
              reason: String::from("no IPv4 addresses found"),
            })?;
          request.extend_from_slice(&ip.octets());
          request.extend_from_slice(self.user_id.as_bytes());
          request.push(0);
        }
      }
      let mut conn = self
        .forward
        .dial(self.proxy_network.as_str(), &self.proxy_address)
        .await?;
      conn.write_all(&request).await?;
      let mut reply = [0u8; 8];
      conn.read_exact(&mut reply).await?;
      if reply[1] != SOCKS4_GRANTED {
        let reason = match reply[1] {
          0x5B => "request rejected or failed",
          0x5C => "identd unreachable",
          0x5D => "identd user mismatch",
          _ => "unknown failure",
        };
        return Err(refused(self.protocol_name(), reason.to_string()));
      }
      tracing::trace!("SOCKS4 tunnel established");
      Ok(conn)
    }
    .instrument(span)
    .boxed()
  }
}

fn refused(proxy: &'static str, reason: String) -> DialerError {
  DialerError::ProxyRefused { proxy, reason }
}
