// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Error taxonomy shared by every dialer
//!
//! All errors are [`Clone`] so that a single failed tunnel establishment can be
//! delivered to every caller that was waiting on it; foreign sources are held in [`Arc`]s.

use std::{path::PathBuf, sync::Arc, time::Duration};

pub type BoxedSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum DialerError {
  #[error("Configuration error: {0}")]
  Configuration(#[from] ConfigurationError),
  #[error("Unknown proxy scheme: {0}")]
  UnknownScheme(String),
  #[error("Unsupported network type: {0}")]
  UnsupportedNetwork(String),
  #[error("Invalid address {address:?}: {reason}")]
  InvalidAddress {
    address: String,
    reason: &'static str,
  },
  #[error("Tunnel establishment failed: {0}")]
  Establishment(#[from] EstablishmentError),
  #[error("Tunnel channel failed: {0}")]
  Channel(#[from] ChannelError),
  #[error("{proxy} proxy refused the connection: {reason}")]
  ProxyRefused { proxy: &'static str, reason: String },
  #[error("{proxy} proxy protocol failure: {source}")]
  Protocol {
    proxy: &'static str,
    source: BoxedSource,
  },
  #[error("Failed to resolve {host:?}: {reason}")]
  Resolution { host: String, reason: String },
  #[error("I/O failure: {0}")]
  Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for DialerError {
  fn from(e: std::io::Error) -> Self {
    DialerError::Io(Arc::new(e))
  }
}

impl DialerError {
  pub fn protocol<E>(proxy: &'static str, source: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    DialerError::Protocol {
      proxy,
      source: Arc::new(source),
    }
  }

  /// Returns `true` if the error originated from an upstream tunnel establishment attempt
  ///
  /// [`Establishment`]: DialerError::Establishment
  #[must_use]
  pub fn is_establishment(&self) -> bool {
    matches!(self, Self::Establishment(_))
  }
}

/// Construction-time failures; these are never retried
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConfigurationError {
  #[error("Malformed proxy URL {url:?}: {reason}")]
  MalformedUrl { url: String, reason: String },
  #[error("The {scheme} proxy scheme requires a username")]
  MissingUsername { scheme: String },
  #[error("Failed to load private key {path:?}: {source}")]
  KeyMaterial { path: PathBuf, source: BoxedSource },
  #[error("Failed to read known_hosts file {path:?}: {source}")]
  KnownHostsUnreadable {
    path: PathBuf,
    source: Arc<std::io::Error>,
  },
  #[error("Malformed known_hosts file {path:?} at line {line}: {reason}")]
  KnownHosts {
    path: PathBuf,
    line: usize,
    reason: String,
  },
  #[error("Invalid {name} setting: {reason}")]
  InvalidSetting {
    name: &'static str,
    reason: &'static str,
  },
  #[error("TLS configuration failed: {0}")]
  Tls(String),
}

/// Failures opening an upstream tunnel session, shared by every waiter of a single attempt
#[derive(thiserror::Error, Debug, Clone)]
pub enum EstablishmentError {
  #[error("Failed to reach tunnel endpoint {address}: {source}")]
  Network {
    address: String,
    source: Arc<DialerError>,
  },
  #[error("Authentication rejected for user {user:?}")]
  Authentication { user: String },
  #[error("Host key for {host} does not match {path:?} line {line}")]
  HostKeyMismatch {
    host: String,
    path: PathBuf,
    line: usize,
  },
  #[error("Host key for {host} is not present in any known_hosts file")]
  UnknownHostKey { host: String },
  #[error("Key authentication is configured without a host key verification policy")]
  NoHostKeyPolicy,
  #[error("Tunnel protocol failure: {0}")]
  Protocol(BoxedSource),
  #[error("Establishment timed out after {0:?}")]
  TimedOut(Duration),
  #[error("Establishment was aborted before completion")]
  Aborted,
}

/// Per-call failures on an otherwise usable session; these never affect session liveness
#[derive(thiserror::Error, Debug, Clone)]
pub enum ChannelError {
  #[error("Tunnel refused a channel to {address}: {source}")]
  Open {
    address: String,
    source: BoxedSource,
  },
  #[error("Keepalive request failed: {0}")]
  Keepalive(BoxedSource),
  #[error("Tunnel session is closed")]
  SessionClosed,
}
