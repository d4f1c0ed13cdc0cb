// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Persistent upstream sessions and the single-flight slot that replaces them

use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::{
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
  },
  time::Duration,
};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{
  config::TunnelConfig,
  transport::{ArcTunnelClient, TunnelConnector},
};
use crate::{
  common::error::{DialerError, EstablishmentError},
  util::{cancellation::CancellationListener, dropkick::Dropkick},
};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
  pub fn new(inner: u64) -> SessionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for SessionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("SessionId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub struct MonotonicSessionIds {
  next: AtomicU64,
}

impl MonotonicSessionIds {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> SessionId {
    SessionId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for MonotonicSessionIds {
  fn default() -> Self {
    Self::new(1)
  }
}

/// Observable lifecycle of a dialer's upstream session
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
  /// No establishment has been attempted yet
  Unestablished,
  /// An establishment attempt is in flight
  Establishing,
  /// The current session passed its last liveness check
  Alive,
  /// The last session failed its probe, or the last establishment failed
  Dead,
}

/// One authenticated upstream session
///
/// Sessions are never revived; a dead session is replaced by a new one.
/// Retiring a session (or dropping its last handle) ends its probe without marking it dead.
pub struct PersistentSession {
  id: SessionId,
  client: ArcTunnelClient,
  alive: Arc<AtomicBool>,
  retirement: Dropkick<CancellationToken>,
}

impl PersistentSession {
  /// Publishes a live session and starts its liveness probe, scoped to `retirement`
  pub fn start(
    id: SessionId,
    client: ArcTunnelClient,
    keepalive_interval: Duration,
    retirement: CancellationToken,
  ) -> Arc<Self> {
    let alive = Arc::new(AtomicBool::new(true));
    spawn_probe(
      id,
      Arc::clone(&client),
      Arc::clone(&alive),
      keepalive_interval,
      CancellationListener::from(&retirement),
    );
    Arc::new(Self {
      id,
      client,
      alive,
      retirement: Dropkick::new(retirement),
    })
  }

  pub fn id(&self) -> SessionId {
    self.id
  }

  pub fn client(&self) -> &ArcTunnelClient {
    &self.client
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  pub fn is_retired(&self) -> bool {
    self.retirement.is_cancelled()
  }

  /// Stops the probe; channels already opened on the session are left to finish
  pub fn retire(&self) {
    self.retirement.cancel();
  }
}

impl std::fmt::Debug for PersistentSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PersistentSession")
      .field("id", &self.id)
      .field("alive", &self.is_alive())
      .field("retired", &self.is_retired())
      .finish_non_exhaustive()
  }
}

fn spawn_probe(
  id: SessionId,
  client: ArcTunnelClient,
  alive: Arc<AtomicBool>,
  interval: Duration,
  retirement: CancellationListener,
) {
  let span = tracing::debug_span!("session_probe", session = %id);
  tokio::spawn(
    async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          biased;
          _ = retirement.cancelled() => break,
          _ = ticker.tick() => {}
        }
        let result = tokio::select! {
          biased;
          _ = retirement.cancelled() => break,
          result = client.keepalive() => result,
        };
        match result {
          Ok(()) => tracing::trace!("Keepalive acknowledged"),
          Err(e) => {
            alive.store(false, Ordering::SeqCst);
            tracing::warn!(error = %e, "Keepalive failed; session marked dead");
            return;
          }
        }
      }
      tracing::trace!("Probe retired");
    }
    .instrument(span),
  );
}

type Outcome = Result<Arc<PersistentSession>, DialerError>;

#[derive(Clone)]
struct InFlight {
  id: SessionId,
  outcome: Shared<BoxFuture<'static, Outcome>>,
}

/// Holds the current session and single-flights its replacement
///
/// The fast path is a lock-free load; only callers finding no live session
/// take the mutex, under which they either join the in-flight attempt or start one.
pub struct SessionSlot {
  config: Arc<TunnelConfig>,
  connector: Arc<dyn TunnelConnector>,
  current: ArcSwapOption<PersistentSession>,
  in_flight: Mutex<Option<InFlight>>,
  attempted: AtomicBool,
  ids: MonotonicSessionIds,
  lifetime: CancellationToken,
}

impl SessionSlot {
  /// Creates an empty slot; sessions are scoped to children of `lifetime`
  pub fn new(
    config: Arc<TunnelConfig>,
    connector: Arc<dyn TunnelConnector>,
    lifetime: CancellationToken,
  ) -> Self {
    Self {
      config,
      connector,
      current: ArcSwapOption::empty(),
      in_flight: Mutex::new(None),
      attempted: AtomicBool::new(false),
      ids: MonotonicSessionIds::default(),
      lifetime,
    }
  }

  pub fn config(&self) -> &Arc<TunnelConfig> {
    &self.config
  }

  pub fn current(&self) -> Option<Arc<PersistentSession>> {
    self.current.load_full()
  }

  fn live(&self) -> Option<Arc<PersistentSession>> {
    self.current.load_full().filter(|s| s.is_alive())
  }

  fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
    // Critical sections never panic, but a poisoned marker is still usable
    self
      .in_flight
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn state(&self) -> SessionState {
    let in_flight = self.lock_in_flight();
    if in_flight.is_some() {
      return SessionState::Establishing;
    }
    match self.current.load_full() {
      Some(session) if session.is_alive() => SessionState::Alive,
      Some(_) => SessionState::Dead,
      None if self.attempted.load(Ordering::SeqCst) => SessionState::Dead,
      None => SessionState::Unestablished,
    }
  }

  /// Returns a live session, establishing one if necessary
  ///
  /// Concurrent callers share a single attempt and all observe its outcome.
  /// Dropping the returned future does not cancel the attempt.
  pub async fn session(self: &Arc<Self>) -> Outcome {
    if let Some(session) = self.live() {
      return Ok(session);
    }
    let outcome = {
      let mut in_flight = self.lock_in_flight();
      if let Some(session) = self.live() {
        return Ok(session);
      }
      match in_flight.as_ref() {
        // A finished attempt that never cleared its marker panicked; start over
        Some(attempt) if attempt.outcome.peek().is_none() => {
          tracing::trace!(session = %attempt.id, "Joining in-flight establishment");
          attempt.outcome.clone()
        }
        _ => {
          let attempt = self.begin();
          let outcome = attempt.outcome.clone();
          *in_flight = Some(attempt);
          outcome
        }
      }
    };
    outcome.await
  }

  /// Spawns an establishment attempt; must be called with the in-flight lock held
  fn begin(self: &Arc<Self>) -> InFlight {
    let id = self.ids.next();
    self.attempted.store(true, Ordering::SeqCst);
    let span = tracing::info_span!("session_establish", session = %id, address = %self.config.address());
    let slot = Arc::clone(self);
    let task = tokio::spawn(async move { slot.establish(id).await }.instrument(span));
    let outcome = async move {
      match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
          tracing::error!(error = %e, "Session establishment task failed");
          Err(EstablishmentError::Aborted.into())
        }
      }
    }
    .boxed()
    .shared();
    InFlight { id, outcome }
  }

  async fn establish(self: Arc<Self>, id: SessionId) -> Outcome {
    tracing::debug!("Establishing tunnel session");
    let timeout = self.config.connect_timeout();
    let connect = self.connector.connect(Arc::clone(&self.config));
    let result = tokio::select! {
      _ = self.lifetime.cancelled() => Err(EstablishmentError::Aborted),
      result = tokio::time::timeout(timeout, connect) => {
        result.unwrap_or(Err(EstablishmentError::TimedOut(timeout)))
      }
    };

    let mut in_flight = self.lock_in_flight();
    if in_flight.as_ref().map(|a| a.id) == Some(id) {
      *in_flight = None;
    }
    match result {
      Ok(client) => {
        let session = PersistentSession::start(
          id,
          client,
          self.config.keepalive_interval(),
          self.lifetime.child_token(),
        );
        if let Some(previous) = self.current.swap(Some(Arc::clone(&session))) {
          previous.retire();
          tracing::debug!(previous = %previous.id(), "Retired superseded session");
        }
        drop(in_flight);
        tracing::info!("Tunnel session established");
        Ok(session)
      }
      Err(e) => {
        drop(in_flight);
        tracing::warn!(error = %e, "Tunnel session establishment failed");
        Err(e.into())
      }
    }
  }
}

impl std::fmt::Debug for SessionSlot {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionSlot")
      .field("address", &self.config.address())
      .field("state", &self.state())
      .field("current", &self.current.load_full())
      .finish_non_exhaustive()
  }
}
