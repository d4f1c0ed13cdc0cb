// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The seam between session lifecycle management and the SSH protocol implementation

use futures::future::{BoxFuture, FutureExt};
use russh::client;
use russh_keys::key::PublicKey;
use std::{
  sync::{Arc, Mutex},
  time::Duration,
};
use tracing_futures::Instrument;

use super::config::TunnelConfig;
use crate::{
  common::{
    dialer::ArcDialer,
    direct::Direct,
    error::{ChannelError, EstablishmentError},
  },
  util::tunnel_stream::WrappedStream,
};

pub type ArcTunnelClient = Arc<dyn TunnelClient>;

/// An authenticated upstream session able to carry forwarded channels
#[cfg_attr(test, mockall::automock)]
pub trait TunnelClient: Send + Sync + 'static {
  /// Opens a `direct-tcpip` channel to `host:port`
  fn open_channel(&self, host: String, port: u16)
    -> BoxFuture<'static, Result<WrappedStream, ChannelError>>;

  /// Sends one keepalive request; any failure means the session is unusable
  fn keepalive(&self) -> BoxFuture<'static, Result<(), ChannelError>>;
}

/// Produces authenticated sessions for a tunnel configuration
pub trait TunnelConnector: Send + Sync + 'static {
  fn connect(
    &self,
    config: Arc<TunnelConfig>,
  ) -> BoxFuture<'static, Result<ArcTunnelClient, EstablishmentError>>;
}

/// Applies the tunnel's host key policy to a key presented by the server
pub fn check_host_key(
  config: &TunnelConfig,
  server_key: &PublicKey,
) -> Result<(), EstablishmentError> {
  config.host_key_policy().check(
    !config.keys().is_empty(),
    config.host(),
    config.port(),
    server_key,
  )
}

/// Unanswered keepalives after which russh closes the session on its own
const KEEPALIVE_MAX: usize = 3;

/// Establishes sessions with `russh`
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

impl RusshConnector {
  pub fn shared() -> Arc<dyn TunnelConnector> {
    Arc::new(RusshConnector)
  }
}

impl TunnelConnector for RusshConnector {
  fn connect(
    &self,
    config: Arc<TunnelConfig>,
  ) -> BoxFuture<'static, Result<ArcTunnelClient, EstablishmentError>> {
    let span = tracing::debug_span!("ssh_connect", address = %config.address());
    async move {
      let forward: ArcDialer = match (config.forward(), config.resolver()) {
        (Some(forward), _) => Arc::clone(forward),
        (None, Some(resolver)) => Arc::new(Direct::new(Arc::clone(resolver))),
        (None, None) => Direct::shared(),
      };
      let stream = forward
        .dial("tcp", config.address())
        .await
        .map_err(|e| EstablishmentError::Network {
          address: config.address().to_string(),
          source: Arc::new(e),
        })?;

      let verdict = Arc::new(Mutex::new(None));
      let handler = HostKeyHandler {
        config: Arc::clone(&config),
        verdict: Arc::clone(&verdict),
      };
      let ssh_config = Arc::new(client::Config {
        keepalive_interval: Some(config.keepalive_interval()),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
      });
      let mut handle = match client::connect_stream(ssh_config, stream, handler).await {
        Ok(handle) => handle,
        Err(e) => {
          // A rejected host key surfaces as a generic protocol error; prefer the recorded reason
          let rejected = verdict.lock().ok().and_then(|mut v| v.take());
          return Err(rejected.unwrap_or_else(|| EstablishmentError::Protocol(Arc::new(e))));
        }
      };
      tracing::trace!("SSH transport established");

      let user = config.auth().user.clone();
      let mut authenticated = false;
      // Without keys an empty password is still offered
      let password = match (&config.auth().password, config.keys().is_empty()) {
        (Some(password), _) => Some(password.as_str()),
        (None, true) => Some(""),
        (None, false) => None,
      };
      if let Some(password) = password {
        authenticated = handle
          .authenticate_password(user.as_str(), password)
          .await
          .map_err(|e| EstablishmentError::Protocol(Arc::new(e)))?;
      }
      for key in config.keys() {
        if authenticated {
          break;
        }
        authenticated = handle
          .authenticate_publickey(user.as_str(), Arc::clone(key))
          .await
          .map_err(|e| EstablishmentError::Protocol(Arc::new(e)))?;
      }
      if !authenticated {
        return Err(EstablishmentError::Authentication { user });
      }
      tracing::debug!(user = %user, "SSH session authenticated");
      Ok(Arc::new(RusshClient {
        handle: Arc::new(handle),
        reply_timeout: config.connect_timeout(),
      }) as ArcTunnelClient)
    }
    .instrument(span)
    .boxed()
  }
}

struct HostKeyHandler {
  config: Arc<TunnelConfig>,
  verdict: Arc<Mutex<Option<EstablishmentError>>>,
}

#[async_trait::async_trait]
impl client::Handler for HostKeyHandler {
  type Error = russh::Error;

  async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
    match check_host_key(&self.config, server_public_key) {
      Ok(()) => Ok(true),
      Err(e) => {
        tracing::warn!(address = %self.config.address(), error = %e, "Rejected SSH host key");
        if let Ok(mut verdict) = self.verdict.lock() {
          *verdict = Some(e);
        }
        Ok(false)
      }
    }
  }
}

struct RusshClient {
  handle: Arc<client::Handle<HostKeyHandler>>,
  reply_timeout: Duration,
}

impl TunnelClient for RusshClient {
  fn open_channel(
    &self,
    host: String,
    port: u16,
  ) -> BoxFuture<'static, Result<WrappedStream, ChannelError>> {
    let handle = Arc::clone(&self.handle);
    async move {
      if handle.is_closed() {
        return Err(ChannelError::SessionClosed);
      }
      let channel = handle
        .channel_open_direct_tcpip(host.as_str(), u32::from(port), "127.0.0.1", 0)
        .await
        .map_err(|e| ChannelError::Open {
          address: format!("{}:{}", host, port),
          source: Arc::new(e),
        })?;
      Ok(WrappedStream::boxed(channel.into_stream()))
    }
    .boxed()
  }

  /// Round-trips a `cancel-tcpip-forward` global request for nothing
  ///
  /// Servers answer it without side effects; a refusal still proves the session responsive.
  fn keepalive(&self) -> BoxFuture<'static, Result<(), ChannelError>> {
    let handle = Arc::clone(&self.handle);
    let reply_timeout = self.reply_timeout;
    async move {
      if handle.is_closed() {
        return Err(ChannelError::SessionClosed);
      }
      match tokio::time::timeout(reply_timeout, handle.cancel_tcpip_forward("", 0)).await {
        Ok(Ok(())) | Ok(Err(russh::Error::RequestDenied)) => Ok(()),
        Ok(Err(e)) => Err(ChannelError::Keepalive(Arc::new(e))),
        Err(_) => Err(ChannelError::Keepalive(Arc::new(std::io::Error::new(
          std::io::ErrorKind::TimedOut,
          "no reply to keepalive request",
        )))),
      }
    }
    .boxed()
  }
}
