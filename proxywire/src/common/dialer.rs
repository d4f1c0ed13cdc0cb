// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Capabilities shared by every proxy transport

use downcast_rs::{impl_downcast, DowncastSync};
use futures::future::{BoxFuture, FutureExt};
use std::{fmt::Debug, net::IpAddr, str::FromStr, sync::Arc};

use super::error::DialerError;
use crate::util::tunnel_stream::WrappedStream;

pub type ArcDialer = Arc<dyn Dialer>;
pub type ArcResolver = Arc<dyn Resolver>;

/// A means to establish a connection, possibly through one or more proxies
///
/// Implementations are shared between callers and may be dialed concurrently.
pub trait Dialer: DowncastSync + Debug {
  /// Connects to `address` (`host:port`) over `network` via this dialer's transport
  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>>;
}
impl_downcast!(sync Dialer);

/// A means to transform a hostname into addresses
pub trait Resolver: Send + Sync + Debug + 'static {
  fn lookup_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DialerError>>;
}

/// Resolves names through the operating system via tokio's blocking resolver pool
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl SystemResolver {
  pub fn shared() -> ArcResolver {
    Arc::new(SystemResolver)
  }
}

impl Resolver for SystemResolver {
  fn lookup_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DialerError>> {
    async move {
      if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
      }
      let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| DialerError::Resolution {
          host: host.to_string(),
          reason: e.to_string(),
        })?;
      let mut ips: Vec<IpAddr> = Vec::new();
      for addr in addrs {
        if !ips.contains(&addr.ip()) {
          ips.push(addr.ip());
        }
      }
      if ips.is_empty() {
        return Err(DialerError::Resolution {
          host: host.to_string(),
          reason: String::from("no addresses found"),
        });
      }
      Ok(ips)
    }
    .boxed()
  }
}

/// Authentication parameters that specific dialers may require
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Auth {
  pub user: String,
  pub password: Option<String>,
}

impl Auth {
  pub fn new<U: Into<String>>(user: U) -> Self {
    Self {
      user: user.into(),
      password: None,
    }
  }

  pub fn with_password<P: Into<String>>(mut self, password: P) -> Self {
    self.password = Some(password.into());
    self
  }

  /// The password, or an empty string when none was supplied
  pub fn password_or_empty(&self) -> &str {
    self.password.as_deref().unwrap_or("")
  }
}

impl std::fmt::Debug for Auth {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Auth")
      .field("user", &self.user)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .finish()
  }
}

/// Stream-oriented network kinds accepted by dialers
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Network {
  Tcp,
  Tcp4,
  Tcp6,
}

impl Network {
  pub fn as_str(&self) -> &'static str {
    match self {
      Network::Tcp => "tcp",
      Network::Tcp4 => "tcp4",
      Network::Tcp6 => "tcp6",
    }
  }

  /// Whether an address of this family may be used for this network kind
  pub fn admits(&self, ip: &IpAddr) -> bool {
    match self {
      Network::Tcp => true,
      Network::Tcp4 => ip.is_ipv4(),
      Network::Tcp6 => ip.is_ipv6(),
    }
  }
}

impl FromStr for Network {
  type Err = DialerError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tcp" => Ok(Network::Tcp),
      "tcp4" => Ok(Network::Tcp4),
      "tcp6" => Ok(Network::Tcp6),
      other => Err(DialerError::UnsupportedNetwork(other.to_string())),
    }
  }
}

impl std::fmt::Display for Network {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}
