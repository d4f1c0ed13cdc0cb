// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Proxy URL schemes and the constructors which turn URLs into dialers

use dashmap::DashMap;
use std::sync::Arc;
use url::Url;

use super::{
  dialer::{ArcDialer, ArcResolver, Auth},
  error::{ConfigurationError, DialerError},
  protocol::{h2_connect, http_connect, http_tunnel, socks},
  proxy_url::{auth_from_url, proxy_address, redacted},
  ssh,
};

/// Builds a dialer for a proxy URL, reaching the proxy through `forward`
pub trait DialerConstructor: Send + Sync + 'static {
  fn construct(
    &self,
    url: &Url,
    forward: ArcDialer,
    resolver: ArcResolver,
  ) -> Result<ArcDialer, DialerError>;
}

impl<F> DialerConstructor for F
where
  F: Fn(&Url, ArcDialer, ArcResolver) -> Result<ArcDialer, DialerError> + Send + Sync + 'static,
{
  fn construct(
    &self,
    url: &Url,
    forward: ArcDialer,
    resolver: ArcResolver,
  ) -> Result<ArcDialer, DialerError> {
    (self)(url, forward, resolver)
  }
}

pub type ArcConstructor = Arc<dyn DialerConstructor>;

/// Maps URL schemes to dialer constructors
///
/// Clones share the same table. Entries may be added or replaced at any time,
/// concurrently with lookups, but are never removed.
#[derive(Clone)]
pub struct SchemeRegistry {
  constructors: Arc<DashMap<String, ArcConstructor>>,
}

impl SchemeRegistry {
  /// A registry without any schemes
  pub fn new() -> Self {
    Self {
      constructors: Arc::new(DashMap::new()),
    }
  }

  /// A registry knowing every built-in proxy scheme
  pub fn with_builtins() -> Self {
    let registry = Self::new();
    registry.register("socks5", socks5_from_url);
    registry.register("socks", socks5_from_url);
    registry.register("socks4", socks4_from_url);
    registry.register("socks4a", socks4a_from_url);
    registry.register("http", http_from_url);
    registry.register("https", https_from_url);
    registry.register("https+h2", http2_from_url);
    registry.register("ssh", ssh_from_url);
    registry.register("ssh2", ssh_from_url);
    registry.register("http+post", http_tunnel_from_url);
    registry.register("https+post", http_tunnel_from_url);
    registry
  }

  /// Adds or replaces the constructor for `scheme`
  pub fn register<S, F>(&self, scheme: S, constructor: F)
  where
    S: AsRef<str>,
    F: Fn(&Url, ArcDialer, ArcResolver) -> Result<ArcDialer, DialerError> + Send + Sync + 'static,
  {
    self.register_constructor(scheme, Arc::new(constructor));
  }

  pub fn register_constructor<S: AsRef<str>>(&self, scheme: S, constructor: ArcConstructor) {
    let scheme = scheme.as_ref().to_ascii_lowercase();
    if self.constructors.insert(scheme.clone(), constructor).is_some() {
      tracing::debug!(scheme = %scheme, "Replaced proxy scheme constructor");
    } else {
      tracing::trace!(scheme = %scheme, "Registered proxy scheme");
    }
  }

  pub fn resolve(&self, scheme: &str) -> Result<ArcConstructor, DialerError> {
    self
      .constructors
      .get(&scheme.to_ascii_lowercase())
      .map(|entry| Arc::clone(entry.value()))
      .ok_or_else(|| DialerError::UnknownScheme(scheme.to_string()))
  }

  pub fn contains(&self, scheme: &str) -> bool {
    self.constructors.contains_key(&scheme.to_ascii_lowercase())
  }

  /// Registered scheme names, sorted
  pub fn schemes(&self) -> Vec<String> {
    let mut schemes: Vec<String> = self
      .constructors
      .iter()
      .map(|entry| entry.key().clone())
      .collect();
    schemes.sort();
    schemes
  }

  /// Instantiates the dialer described by `url`; no connection is made
  pub fn from_url(
    &self,
    url: &Url,
    forward: ArcDialer,
    resolver: ArcResolver,
  ) -> Result<ArcDialer, DialerError> {
    let constructor = self.resolve(url.scheme())?;
    let dialer = constructor.construct(url, forward, resolver)?;
    tracing::debug!(url = %redacted(url), "Resolved proxy dialer");
    Ok(dialer)
  }

  pub fn from_url_str(
    &self,
    url: &str,
    forward: ArcDialer,
    resolver: ArcResolver,
  ) -> Result<ArcDialer, DialerError> {
    let parsed = Url::parse(url).map_err(|e| ConfigurationError::MalformedUrl {
      url: url.to_string(),
      reason: e.to_string(),
    })?;
    self.from_url(&parsed, forward, resolver)
  }
}

impl Default for SchemeRegistry {
  fn default() -> Self {
    Self::with_builtins()
  }
}

impl std::fmt::Debug for SchemeRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SchemeRegistry")
      .field("schemes", &self.schemes())
      .finish()
  }
}

fn endpoint(url: &Url) -> Result<(String, Option<Auth>), DialerError> {
  Ok((proxy_address(url)?, auth_from_url(url)?))
}

fn socks5_from_url(
  url: &Url,
  forward: ArcDialer,
  resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let (address, auth) = endpoint(url)?;
  socks::socks5("tcp", &address, auth, forward, resolver)
}

fn socks4_from_url(
  url: &Url,
  forward: ArcDialer,
  resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let (address, auth) = endpoint(url)?;
  socks::socks4("tcp", &address, auth, false, forward, resolver)
}

fn socks4a_from_url(
  url: &Url,
  forward: ArcDialer,
  resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let (address, auth) = endpoint(url)?;
  socks::socks4("tcp", &address, auth, true, forward, resolver)
}

fn http_from_url(
  url: &Url,
  forward: ArcDialer,
  _resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let (address, auth) = endpoint(url)?;
  http_connect::http1("tcp", &address, auth, forward)
}

fn https_from_url(
  url: &Url,
  forward: ArcDialer,
  _resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let (address, auth) = endpoint(url)?;
  http_connect::https("tcp", &address, auth, forward)
}

fn http2_from_url(
  url: &Url,
  forward: ArcDialer,
  _resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let (address, auth) = endpoint(url)?;
  h2_connect::http2("tcp", &address, auth, forward)
}

fn ssh_from_url(
  url: &Url,
  forward: ArcDialer,
  resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let (address, auth) = endpoint(url)?;
  ssh::ssh_from_url(url, &address, auth, forward, resolver)
}

fn http_tunnel_from_url(
  url: &Url,
  forward: ArcDialer,
  resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let (address, auth) = endpoint(url)?;
  let scheme = match url.scheme() {
    "https+post" => "https",
    _ => "http",
  };
  http_tunnel::http_tunnel("tcp", scheme, &address, auth, forward, resolver)
}
