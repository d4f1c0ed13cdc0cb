// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A dialer forwarding connections through one persistent SSH session
//!
//! The session is established on first use and reused by every dial. A background
//! probe sends keepalives; once a probe fails the next dial establishes a replacement,
//! with concurrent callers sharing a single attempt.

use futures::future::{BoxFuture, FutureExt};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use url::Url;

pub mod config;
pub mod known_hosts;
pub mod session;
pub mod transport;

pub use config::{HostKeyPolicy, TunnelConfig, TunnelConfigBuilder};
pub use session::{PersistentSession, SessionId, SessionState};
pub use transport::{RusshConnector, TunnelClient, TunnelConnector};

use self::session::SessionSlot;
use crate::{
  common::{
    dialer::{ArcDialer, ArcResolver, Auth, Dialer, Network},
    error::{ConfigurationError, DialerError},
  },
  util::{dropkick::Dropkick, split_host_port, tunnel_stream::WrappedStream},
};

pub struct SshDialer {
  slot: Arc<SessionSlot>,
  // Cancels the probes of every session this dialer created once the dialer is dropped
  _lifetime: Dropkick<CancellationToken>,
}

impl SshDialer {
  pub fn new(config: TunnelConfig) -> Self {
    Self::with_connector(config, RusshConnector::shared())
  }

  pub fn with_connector(config: TunnelConfig, connector: Arc<dyn TunnelConnector>) -> Self {
    let lifetime = CancellationToken::new();
    Self {
      slot: Arc::new(SessionSlot::new(
        Arc::new(config),
        connector,
        lifetime.clone(),
      )),
      _lifetime: Dropkick::new(lifetime),
    }
  }

  pub fn config(&self) -> &TunnelConfig {
    self.slot.config()
  }

  pub fn state(&self) -> SessionState {
    self.slot.state()
  }

  /// The most recently published session, whether or not it is still alive
  pub fn current_session(&self) -> Option<Arc<PersistentSession>> {
    self.slot.current()
  }
}

impl std::fmt::Debug for SshDialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SshDialer")
      .field("config", self.config())
      .field("state", &self.state())
      .finish()
  }
}

impl Dialer for SshDialer {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>> {
    let span = tracing::debug_span!("ssh_dial", proxy = %self.config().address(), address);
    async move {
      network.parse::<Network>()?;
      let (host, port) = split_host_port(address)?;
      let session = self.slot.session().await?;
      match session.client().open_channel(host.to_string(), port).await {
        Ok(stream) => {
          tracing::trace!(session = %session.id(), "Channel opened");
          Ok(stream)
        }
        Err(e) => {
          tracing::debug!(session = %session.id(), error = %e, "Channel open failed");
          Err(e.into())
        }
      }
    }
    .instrument(span)
    .boxed()
  }
}

/// Translates the query of an `ssh`/`ssh2` proxy URL into tunnel parameters
///
/// `keys` and `key` list private key files and may repeat; `skip_known_hosts` accepts
/// any host key, unless `known_hosts` files are also named, which then take precedence.
/// `keepalive_interval` and `connect_timeout` are given in seconds.
pub fn tunnel_config_from_url(
  url: &Url,
  address: &str,
  auth: Option<Auth>,
) -> Result<TunnelConfigBuilder, DialerError> {
  let auth = auth.ok_or_else(|| ConfigurationError::MissingUsername {
    scheme: url.scheme().to_string(),
  })?;
  let mut keys = Vec::new();
  let mut key = Vec::new();
  let mut known_hosts = Vec::new();
  let mut skip_known_hosts = false;
  let mut builder = TunnelConfig::builder(address, auth);
  for (name, value) in url.query_pairs() {
    match name.as_ref() {
      "keys" => keys.push(value.into_owned()),
      "key" => key.push(value.into_owned()),
      "known_hosts" => known_hosts.push(value.into_owned()),
      "skip_known_hosts" => skip_known_hosts = true,
      "keepalive_interval" => {
        builder = builder.keepalive_interval(seconds_parameter(url, "keepalive_interval", &value)?)
      }
      "connect_timeout" => {
        builder = builder.connect_timeout(seconds_parameter(url, "connect_timeout", &value)?)
      }
      other => tracing::debug!(parameter = other, "Ignoring unknown ssh proxy parameter"),
    }
  }
  builder = builder.key_files(keys.into_iter().chain(key));
  if !known_hosts.is_empty() {
    if skip_known_hosts {
      tracing::warn!(
        address,
        "Both skip_known_hosts and known_hosts were given; known_hosts takes precedence"
      );
    }
    builder = builder.known_hosts_files(known_hosts);
  } else if skip_known_hosts {
    builder = builder.skip_host_key_verification();
  }
  Ok(builder)
}

fn seconds_parameter(url: &Url, name: &str, value: &str) -> Result<Duration, ConfigurationError> {
  value
    .parse::<u64>()
    .map(Duration::from_secs)
    .map_err(|_| ConfigurationError::MalformedUrl {
      url: url.to_string(),
      reason: format!("{} must be a whole number of seconds", name),
    })
}

/// Builds an SSH tunnel dialer from an `ssh`/`ssh2` proxy URL
///
/// Nothing is connected until the first dial.
pub fn ssh_from_url(
  url: &Url,
  address: &str,
  auth: Option<Auth>,
  forward: ArcDialer,
  resolver: ArcResolver,
) -> Result<ArcDialer, DialerError> {
  let config = tunnel_config_from_url(url, address, auth)?
    .forward(forward)
    .resolver(resolver)
    .build()?;
  Ok(Arc::new(SshDialer::new(config)))
}

#[cfg(test)]
mod tests {
  use futures::future::{BoxFuture, FutureExt};
  use std::{
    path::PathBuf,
    sync::{
      atomic::{AtomicBool, AtomicUsize, Ordering},
      Arc, Mutex,
    },
    time::Duration,
  };

  use super::{
    tunnel_config_from_url, HostKeyPolicy, SessionState, SshDialer, TunnelClient, TunnelConfig,
    TunnelConnector,
  };
  use crate::{
    common::{
      dialer::{Auth, Dialer},
      error::{ChannelError, ConfigurationError, DialerError, EstablishmentError},
      ssh::{
        known_hosts::tests::{known_hosts_file, BASEPOINT_KEY},
        transport::ArcTunnelClient,
      },
    },
    util::tunnel_stream::WrappedStream,
  };

  struct FakeClient {
    healthy: AtomicBool,
    refuse_channels: bool,
    keepalives: AtomicUsize,
    channels: AtomicUsize,
  }

  impl FakeClient {
    fn keepalives(&self) -> usize {
      self.keepalives.load(Ordering::SeqCst)
    }
  }

  impl TunnelClient for FakeClient {
    fn open_channel(
      &self,
      host: String,
      port: u16,
    ) -> BoxFuture<'static, Result<WrappedStream, ChannelError>> {
      self.channels.fetch_add(1, Ordering::SeqCst);
      let result = if self.refuse_channels {
        Err(ChannelError::Open {
          address: format!("{}:{}", host, port),
          source: Arc::new(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "administratively prohibited",
          )),
        })
      } else {
        Ok(WrappedStream::duplex(64).0)
      };
      futures::future::ready(result).boxed()
    }

    fn keepalive(&self) -> BoxFuture<'static, Result<(), ChannelError>> {
      self.keepalives.fetch_add(1, Ordering::SeqCst);
      let result = if self.healthy.load(Ordering::SeqCst) {
        Ok(())
      } else {
        Err(ChannelError::SessionClosed)
      };
      futures::future::ready(result).boxed()
    }
  }

  #[derive(Default)]
  struct FakeConnector {
    connects: AtomicUsize,
    delay: Duration,
    refuse_channels: bool,
    failure: Mutex<Option<EstablishmentError>>,
    clients: Mutex<Vec<Arc<FakeClient>>>,
  }

  impl FakeConnector {
    fn connects(&self) -> usize {
      self.connects.load(Ordering::SeqCst)
    }

    fn client(&self, index: usize) -> Arc<FakeClient> {
      Arc::clone(&self.clients.lock().unwrap()[index])
    }

    fn fail_with(&self, failure: Option<EstablishmentError>) {
      *self.failure.lock().unwrap() = failure;
    }
  }

  impl TunnelConnector for FakeConnector {
    fn connect(
      &self,
      _config: Arc<TunnelConfig>,
    ) -> BoxFuture<'static, Result<ArcTunnelClient, EstablishmentError>> {
      self.connects.fetch_add(1, Ordering::SeqCst);
      let delay = self.delay;
      let failure = self.failure.lock().unwrap().clone();
      let client = Arc::new(FakeClient {
        healthy: AtomicBool::new(true),
        refuse_channels: self.refuse_channels,
        keepalives: AtomicUsize::new(0),
        channels: AtomicUsize::new(0),
      });
      if failure.is_none() {
        self.clients.lock().unwrap().push(Arc::clone(&client));
      }
      async move {
        tokio::time::sleep(delay).await;
        match failure {
          Some(e) => Err(e),
          None => Ok(client as ArcTunnelClient),
        }
      }
      .boxed()
    }
  }

  fn dialer_with(connector: Arc<FakeConnector>) -> SshDialer {
    let config = TunnelConfig::builder("proxyhost:22", Auth::new("alice").with_password("secret"))
      .keepalive_interval(Duration::from_secs(10))
      .connect_timeout(Duration::from_secs(5))
      .build()
      .unwrap();
    SshDialer::with_connector(config, connector)
  }

  #[tokio::test]
  async fn first_dial_establishes_and_later_dials_reuse() {
    let connector = Arc::new(FakeConnector::default());
    let dialer = dialer_with(connector.clone());
    assert_eq!(dialer.state(), SessionState::Unestablished);
    assert_eq!(connector.connects(), 0, "construction must not connect");

    dialer.dial("tcp", "example.com:443").await.unwrap();
    let first = dialer.current_session().unwrap().id();
    dialer.dial("tcp4", "example.com:80").await.unwrap();
    assert_eq!(connector.connects(), 1);
    assert_eq!(dialer.current_session().unwrap().id(), first);
    assert_eq!(dialer.state(), SessionState::Alive);
    assert_eq!(connector.client(0).channels.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_dials_share_one_establishment() {
    let connector = Arc::new(FakeConnector {
      delay: Duration::from_millis(100),
      ..Default::default()
    });
    let dialer = dialer_with(connector.clone());
    let results =
      futures::future::join_all((0..16).map(|_| dialer.dial("tcp", "example.com:443"))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(connector.connects(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_dials_share_one_failure() {
    let connector = Arc::new(FakeConnector {
      delay: Duration::from_millis(100),
      ..Default::default()
    });
    connector.fail_with(Some(EstablishmentError::Authentication {
      user: String::from("alice"),
    }));
    let dialer = dialer_with(connector.clone());
    let results =
      futures::future::join_all((0..8).map(|_| dialer.dial("tcp", "example.com:443"))).await;
    assert_eq!(connector.connects(), 1);
    for result in results {
      assert!(matches!(
        result,
        Err(DialerError::Establishment(
          EstablishmentError::Authentication { ref user }
        )) if user == "alice"
      ));
    }
    assert_eq!(dialer.state(), SessionState::Dead);

    // Failures are not cached; the next dial tries again
    connector.fail_with(None);
    dialer.dial("tcp", "example.com:443").await.unwrap();
    assert_eq!(connector.connects(), 2);
    assert_eq!(dialer.state(), SessionState::Alive);
  }

  #[tokio::test(start_paused = true)]
  async fn failed_probe_triggers_reestablishment() {
    let connector = Arc::new(FakeConnector::default());
    let dialer = dialer_with(connector.clone());
    dialer.dial("tcp", "example.com:443").await.unwrap();
    let first = connector.client(0);
    let first_id = dialer.current_session().unwrap().id();

    first.healthy.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(dialer.state(), SessionState::Dead);
    assert_eq!(first.keepalives(), 1);

    dialer.dial("tcp", "example.com:443").await.unwrap();
    assert_eq!(connector.connects(), 2);
    assert_ne!(dialer.current_session().unwrap().id(), first_id);
    assert_eq!(dialer.state(), SessionState::Alive);

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(first.keepalives(), 1, "the replaced session must not be probed");
    assert_eq!(connector.client(1).keepalives(), 3);
  }

  #[tokio::test]
  async fn channel_failures_leave_session_alive() {
    let connector = Arc::new(FakeConnector {
      refuse_channels: true,
      ..Default::default()
    });
    let dialer = dialer_with(connector.clone());
    let err = dialer.dial("tcp", "internal:25").await.unwrap_err();
    assert!(
      matches!(&err, DialerError::Channel(ChannelError::Open { address, .. }) if address == "internal:25"),
      "unexpected error {:?}",
      err
    );
    assert_eq!(dialer.state(), SessionState::Alive);
    dialer.dial("tcp", "internal:25").await.unwrap_err();
    assert_eq!(connector.connects(), 1);
  }

  #[tokio::test]
  async fn invalid_requests_never_connect() {
    let connector = Arc::new(FakeConnector::default());
    let dialer = dialer_with(connector.clone());
    assert!(matches!(
      dialer.dial("udp", "example.com:53").await,
      Err(DialerError::UnsupportedNetwork(n)) if n == "udp"
    ));
    assert!(matches!(
      dialer.dial("tcp", "example.com").await,
      Err(DialerError::InvalidAddress { .. })
    ));
    assert_eq!(connector.connects(), 0);
    assert_eq!(dialer.state(), SessionState::Unestablished);
  }

  #[tokio::test(start_paused = true)]
  async fn establishment_is_bounded_by_timeout() {
    let connector = Arc::new(FakeConnector {
      delay: Duration::from_secs(60),
      ..Default::default()
    });
    let dialer = dialer_with(connector.clone());
    let err = dialer.dial("tcp", "example.com:443").await.unwrap_err();
    assert!(matches!(
      err,
      DialerError::Establishment(EstablishmentError::TimedOut(t)) if t == Duration::from_secs(5)
    ));
    assert_eq!(dialer.state(), SessionState::Dead);
  }

  #[tokio::test(start_paused = true)]
  async fn abandoned_waiters_do_not_cancel_establishment() {
    let connector = Arc::new(FakeConnector {
      delay: Duration::from_millis(100),
      ..Default::default()
    });
    let dialer = dialer_with(connector.clone());
    let abandoned =
      tokio::time::timeout(Duration::from_millis(10), dialer.dial("tcp", "example.com:443")).await;
    assert!(abandoned.is_err());
    assert_eq!(dialer.state(), SessionState::Establishing);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dialer.state(), SessionState::Alive);
    dialer.dial("tcp", "example.com:443").await.unwrap();
    assert_eq!(connector.connects(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn dropping_the_dialer_stops_probing() {
    let connector = Arc::new(FakeConnector::default());
    let dialer = dialer_with(connector.clone());
    dialer.dial("tcp", "example.com:443").await.unwrap();
    tokio::time::sleep(Duration::from_secs(15)).await;
    let client = connector.client(0);
    assert_eq!(client.keepalives(), 1);
    drop(dialer);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.keepalives(), 1);
  }

  #[test]
  fn url_parameters_concatenate_key_lists() {
    let url = url::Url::parse(
      "ssh2://alice@proxyhost?keys=/k/one&key=/k/two&keys=/k/three&keepalive_interval=15",
    )
    .unwrap();
    let builder = tunnel_config_from_url(&url, "proxyhost:22", Some(Auth::new("alice"))).unwrap();
    assert_eq!(
      builder.pending_key_files(),
      &[
        PathBuf::from("/k/one"),
        PathBuf::from("/k/three"),
        PathBuf::from("/k/two")
      ]
    );
  }

  #[test]
  fn url_known_hosts_take_precedence_over_skip() {
    let file = known_hosts_file(&format!("proxyhost ssh-ed25519 {}\n", BASEPOINT_KEY));
    let url = url::Url::parse(&format!(
      "ssh2://alice@proxyhost?skip_known_hosts&known_hosts={}",
      file.path().display()
    ))
    .unwrap();
    let config = tunnel_config_from_url(&url, "proxyhost:22", Some(Auth::new("alice")))
      .unwrap()
      .build()
      .unwrap();
    assert!(matches!(
      config.host_key_policy(),
      HostKeyPolicy::KnownHosts(_)
    ));
  }

  #[test]
  fn url_requires_username() {
    let url = url::Url::parse("ssh://proxyhost").unwrap();
    assert!(matches!(
      tunnel_config_from_url(&url, "proxyhost:22", None),
      Err(DialerError::Configuration(
        ConfigurationError::MissingUsername { .. }
      ))
    ));
    let url = url::Url::parse("ssh://alice@proxyhost?connect_timeout=soon").unwrap();
    assert!(matches!(
      tunnel_config_from_url(&url, "proxyhost:22", Some(Auth::new("alice"))),
      Err(DialerError::Configuration(ConfigurationError::MalformedUrl { .. }))
    ));
  }
}
