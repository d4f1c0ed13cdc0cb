// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use russh_keys::key::{KeyPair, PublicKey};
use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use super::known_hosts::KnownHosts;
use crate::{
  common::{
    dialer::{ArcDialer, ArcResolver, Auth},
    error::{ConfigurationError, DialerError, EstablishmentError},
  },
  util::split_host_port,
};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How server host keys are checked when key authentication is configured
#[derive(Debug, Clone, Default)]
pub enum HostKeyPolicy {
  /// No policy was chosen; key-authenticated sessions are refused
  #[default]
  Unspecified,
  /// Any host key is accepted
  Skip,
  /// Host keys must match an entry in the loaded files
  KnownHosts(KnownHosts),
}

impl HostKeyPolicy {
  pub fn is_skip(&self) -> bool {
    matches!(self, HostKeyPolicy::Skip)
  }

  /// Decides whether `server_key` is acceptable for `host:port`
  ///
  /// The policy only applies when `key_auth` is set; password-only tunnels
  /// accept whatever key the server presents.
  pub fn check(
    &self,
    key_auth: bool,
    host: &str,
    port: u16,
    server_key: &PublicKey,
  ) -> Result<(), EstablishmentError> {
    if !key_auth {
      return Ok(());
    }
    match self {
      HostKeyPolicy::Skip => Ok(()),
      HostKeyPolicy::KnownHosts(known_hosts) => known_hosts.verify(host, port, server_key),
      HostKeyPolicy::Unspecified => Err(EstablishmentError::NoHostKeyPolicy),
    }
  }
}

/// Validated, immutable parameters of a persistent SSH tunnel
#[derive(Clone)]
pub struct TunnelConfig {
  address: String,
  host: String,
  port: u16,
  auth: Auth,
  keys: Vec<Arc<KeyPair>>,
  key_files: Vec<PathBuf>,
  host_key_policy: HostKeyPolicy,
  forward: Option<ArcDialer>,
  resolver: Option<ArcResolver>,
  keepalive_interval: Duration,
  connect_timeout: Duration,
}

impl TunnelConfig {
  pub fn builder<A: Into<String>>(address: A, auth: Auth) -> TunnelConfigBuilder {
    TunnelConfigBuilder::new(address, auth)
  }

  /// The SSH server, as `host:port`
  pub fn address(&self) -> &str {
    &self.address
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn auth(&self) -> &Auth {
    &self.auth
  }

  pub fn keys(&self) -> &[Arc<KeyPair>] {
    &self.keys
  }

  pub fn key_files(&self) -> &[PathBuf] {
    &self.key_files
  }

  pub fn host_key_policy(&self) -> &HostKeyPolicy {
    &self.host_key_policy
  }

  pub fn forward(&self) -> Option<&ArcDialer> {
    self.forward.as_ref()
  }

  pub fn resolver(&self) -> Option<&ArcResolver> {
    self.resolver.as_ref()
  }

  pub fn keepalive_interval(&self) -> Duration {
    self.keepalive_interval
  }

  pub fn connect_timeout(&self) -> Duration {
    self.connect_timeout
  }
}

impl std::fmt::Debug for TunnelConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TunnelConfig")
      .field("address", &self.address)
      .field("auth", &self.auth)
      .field("key_files", &self.key_files)
      .field("host_key_policy", &self.host_key_policy)
      .field("forward", &self.forward)
      .field("keepalive_interval", &self.keepalive_interval)
      .field("connect_timeout", &self.connect_timeout)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Clone)]
enum HostKeyChoice {
  Unspecified,
  Skip,
  KnownHosts(Vec<PathBuf>),
}

/// Collects tunnel parameters; nothing touches the filesystem until [`TunnelConfigBuilder::build`]
#[derive(Debug, Clone)]
pub struct TunnelConfigBuilder {
  address: String,
  auth: Auth,
  key_files: Vec<PathBuf>,
  host_keys: HostKeyChoice,
  forward: Option<ArcDialer>,
  resolver: Option<ArcResolver>,
  keepalive_interval: Duration,
  connect_timeout: Duration,
}

impl TunnelConfigBuilder {
  pub fn new<A: Into<String>>(address: A, auth: Auth) -> Self {
    Self {
      address: address.into(),
      auth,
      key_files: Vec::new(),
      host_keys: HostKeyChoice::Unspecified,
      forward: None,
      resolver: None,
      keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
      connect_timeout: DEFAULT_CONNECT_TIMEOUT,
    }
  }

  pub fn key_file<P: AsRef<Path>>(mut self, path: P) -> Self {
    self.key_files.push(path.as_ref().to_path_buf());
    self
  }

  pub fn key_files<I, P>(mut self, paths: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
  {
    self
      .key_files
      .extend(paths.into_iter().map(|p| p.as_ref().to_path_buf()));
    self
  }

  /// Accept any server host key; replaces an earlier host key choice
  pub fn skip_host_key_verification(mut self) -> Self {
    self.host_keys = HostKeyChoice::Skip;
    self
  }

  /// Verify host keys against these files; replaces an earlier host key choice
  pub fn known_hosts_files<I, P>(mut self, paths: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
  {
    self.host_keys = HostKeyChoice::KnownHosts(
      paths
        .into_iter()
        .map(|p| p.as_ref().to_path_buf())
        .collect(),
    );
    self
  }

  /// The dialer used to reach the SSH server; direct connections are used otherwise
  pub fn forward(mut self, forward: ArcDialer) -> Self {
    self.forward = Some(forward);
    self
  }

  pub fn resolver(mut self, resolver: ArcResolver) -> Self {
    self.resolver = Some(resolver);
    self
  }

  pub fn keepalive_interval(mut self, interval: Duration) -> Self {
    self.keepalive_interval = interval;
    self
  }

  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  pub fn pending_key_files(&self) -> &[PathBuf] {
    &self.key_files
  }

  /// Validates the parameters, loading key material and known-hosts files
  pub fn build(self) -> Result<TunnelConfig, DialerError> {
    let (host, port) = split_host_port(&self.address)?;
    if self.auth.user.is_empty() {
      return Err(
        ConfigurationError::MissingUsername {
          scheme: String::from("ssh"),
        }
        .into(),
      );
    }
    if self.keepalive_interval.is_zero() {
      return Err(
        ConfigurationError::InvalidSetting {
          name: "keepalive_interval",
          reason: "must be greater than zero",
        }
        .into(),
      );
    }
    if self.connect_timeout.is_zero() {
      return Err(
        ConfigurationError::InvalidSetting {
          name: "connect_timeout",
          reason: "must be greater than zero",
        }
        .into(),
      );
    }
    let keys = self
      .key_files
      .iter()
      .map(|path| load_key(path))
      .collect::<Result<Vec<_>, _>>()?;
    let host_key_policy = match &self.host_keys {
      HostKeyChoice::Unspecified => HostKeyPolicy::Unspecified,
      HostKeyChoice::Skip => HostKeyPolicy::Skip,
      HostKeyChoice::KnownHosts(files) => HostKeyPolicy::KnownHosts(KnownHosts::load(files)?),
    };
    if !keys.is_empty() && matches!(host_key_policy, HostKeyPolicy::Unspecified) {
      tracing::warn!(
        address = %self.address,
        "Key authentication is configured without a host key policy; establishment will be refused"
      );
    }
    Ok(TunnelConfig {
      host: host.to_string(),
      port,
      address: self.address.clone(),
      auth: self.auth,
      keys,
      key_files: self.key_files,
      host_key_policy,
      forward: self.forward,
      resolver: self.resolver,
      keepalive_interval: self.keepalive_interval,
      connect_timeout: self.connect_timeout,
    })
  }
}

fn load_key(path: &Path) -> Result<Arc<KeyPair>, ConfigurationError> {
  russh_keys::load_secret_key(path, None)
    .map(Arc::new)
    .map_err(|e| ConfigurationError::KeyMaterial {
      path: path.to_path_buf(),
      source: Arc::new(e),
    })
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::{HostKeyPolicy, TunnelConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL};
  use crate::common::{
    dialer::Auth,
    error::{ConfigurationError, DialerError, EstablishmentError},
    ssh::known_hosts::{
      tests::{known_hosts_file, BASEPOINT_KEY, IDENTITY_KEY},
      KnownHosts,
    },
  };

  #[test]
  fn defaults() {
    let config = TunnelConfig::builder("proxyhost:22", Auth::new("alice").with_password("secret"))
      .build()
      .unwrap();
    assert_eq!(config.host(), "proxyhost");
    assert_eq!(config.port(), 22);
    assert_eq!(config.keepalive_interval(), DEFAULT_KEEPALIVE_INTERVAL);
    assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
    assert!(matches!(config.host_key_policy(), HostKeyPolicy::Unspecified));
    assert!(config.keys().is_empty());
    assert!(config.forward().is_none());
  }

  #[test]
  fn last_host_key_choice_wins() {
    let file = known_hosts_file(&format!("proxyhost ssh-ed25519 {}\n", BASEPOINT_KEY));
    let config = TunnelConfig::builder("proxyhost:22", Auth::new("alice"))
      .skip_host_key_verification()
      .known_hosts_files([file.path()])
      .build()
      .unwrap();
    match config.host_key_policy() {
      HostKeyPolicy::KnownHosts(known) => {
        assert_eq!(known.len(), 1);
        assert_eq!(known.files(), &[file.path().to_path_buf()]);
      }
      other => panic!("unexpected policy {:?}", other),
    }
    let config = TunnelConfig::builder("proxyhost:22", Auth::new("alice"))
      .known_hosts_files([file.path()])
      .skip_host_key_verification()
      .build()
      .unwrap();
    assert!(config.host_key_policy().is_skip());
  }

  #[test]
  fn username_is_required() {
    let err = TunnelConfig::builder("proxyhost:22", Auth::default())
      .build()
      .unwrap_err();
    assert!(matches!(
      err,
      DialerError::Configuration(ConfigurationError::MissingUsername { .. })
    ));
  }

  #[test]
  fn address_requires_port() {
    let err = TunnelConfig::builder("proxyhost", Auth::new("alice"))
      .build()
      .unwrap_err();
    assert!(matches!(err, DialerError::InvalidAddress { .. }));
  }

  #[test]
  fn unreadable_key_is_reported_eagerly() {
    let err = TunnelConfig::builder("proxyhost:22", Auth::new("alice"))
      .key_file("/nonexistent/proxywire/id_ed25519")
      .skip_host_key_verification()
      .build()
      .unwrap_err();
    assert!(
      matches!(
        &err,
        DialerError::Configuration(ConfigurationError::KeyMaterial { path, .. })
          if path.ends_with("id_ed25519")
      ),
      "unexpected error {:?}",
      err
    );
  }

  #[test]
  fn zero_keepalive_is_rejected() {
    let err = TunnelConfig::builder("proxyhost:22", Auth::new("alice"))
      .keepalive_interval(Duration::ZERO)
      .build()
      .unwrap_err();
    assert!(matches!(
      err,
      DialerError::Configuration(ConfigurationError::InvalidSetting {
        name: "keepalive_interval",
        ..
      })
    ));
  }

  #[test]
  fn host_key_policies() {
    let basepoint = russh_keys::parse_public_key_base64(BASEPOINT_KEY).unwrap();
    let identity = russh_keys::parse_public_key_base64(IDENTITY_KEY).unwrap();

    HostKeyPolicy::Unspecified
      .check(false, "proxyhost", 22, &basepoint)
      .unwrap();
    assert!(matches!(
      HostKeyPolicy::Unspecified.check(true, "proxyhost", 22, &basepoint),
      Err(EstablishmentError::NoHostKeyPolicy)
    ));
    HostKeyPolicy::Skip
      .check(true, "proxyhost", 22, &identity)
      .unwrap();

    let file = known_hosts_file(&format!("proxyhost ssh-ed25519 {}\n", BASEPOINT_KEY));
    let policy = HostKeyPolicy::KnownHosts(KnownHosts::load([file.path()]).unwrap());
    policy.check(true, "proxyhost", 22, &basepoint).unwrap();
    assert!(matches!(
      policy.check(true, "proxyhost", 22, &identity),
      Err(EstablishmentError::HostKeyMismatch { .. })
    ));
    assert!(matches!(
      policy.check(true, "proxyhost", 2200, &basepoint),
      Err(EstablishmentError::UnknownHostKey { .. })
    ));
    // Password-only tunnels ignore the known hosts entirely
    policy.check(false, "proxyhost", 22, &identity).unwrap();
  }
}
