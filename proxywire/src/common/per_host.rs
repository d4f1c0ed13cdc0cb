// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};
use ipnet::IpNet;
use std::net::IpAddr;

use super::{
  dialer::{ArcDialer, Dialer},
  error::DialerError,
};
use crate::util::{split_host_port, tunnel_stream::WrappedStream};

/// Directs connections to a bypass dialer for matching hosts and to a default dialer otherwise
///
/// Rules are networks (`10.0.0.0/8`), addresses, zones (`*.example.com` or
/// `.example.com`, which also match `example.com` itself) and exact hostnames.
#[derive(Debug)]
pub struct PerHost {
  default: ArcDialer,
  bypass: ArcDialer,
  networks: Vec<IpNet>,
  ips: Vec<IpAddr>,
  zones: Vec<String>,
  hosts: Vec<String>,
}

impl PerHost {
  pub fn new(default: ArcDialer, bypass: ArcDialer) -> Self {
    Self {
      default,
      bypass,
      networks: Vec::new(),
      ips: Vec::new(),
      zones: Vec::new(),
      hosts: Vec::new(),
    }
  }

  /// Adds rules from a comma-separated list such as the `no_proxy` variable
  pub fn add_from_str(&mut self, rules: &str) {
    for rule in rules.split(',').map(str::trim).filter(|r| !r.is_empty()) {
      if rule.contains('/') {
        match rule.parse::<IpNet>() {
          Ok(network) => self.add_network(network),
          Err(e) => tracing::debug!(rule, error = %e, "Ignoring malformed network rule"),
        }
      } else if let Ok(ip) = rule.parse::<IpAddr>() {
        self.add_ip(ip);
      } else if let Some(zone) = rule.strip_prefix("*.") {
        self.add_zone(zone);
      } else if rule.starts_with('.') {
        self.add_zone(rule);
      } else {
        self.add_host(rule);
      }
    }
  }

  pub fn add_network(&mut self, network: IpNet) {
    self.networks.push(network);
  }

  pub fn add_ip(&mut self, ip: IpAddr) {
    self.ips.push(ip);
  }

  /// Adds a zone; `example.com` matches `example.com` and all of its subdomains
  pub fn add_zone(&mut self, zone: &str) {
    let zone = zone.trim_end_matches('.').to_ascii_lowercase();
    let zone = if zone.starts_with('.') {
      zone
    } else {
      format!(".{}", zone)
    };
    self.zones.push(zone);
  }

  pub fn add_host(&mut self, host: &str) {
    self
      .hosts
      .push(host.trim_end_matches('.').to_ascii_lowercase());
  }

  /// Whether connections to `host` use the bypass dialer
  pub fn bypasses(&self, host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
      return self.networks.iter().any(|n| n.contains(&ip)) || self.ips.contains(&ip);
    }
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    self
      .zones
      .iter()
      .any(|zone| host.ends_with(zone.as_str()) || host == zone[1..])
      || self.hosts.iter().any(|h| *h == host)
  }

  fn dialer_for(&self, host: &str) -> &ArcDialer {
    if self.bypasses(host) {
      &self.bypass
    } else {
      &self.default
    }
  }
}

impl Dialer for PerHost {
  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<WrappedStream, DialerError>> {
    async move {
      let (host, _) = split_host_port(address)?;
      let dialer = self.dialer_for(host);
      tracing::trace!(address, bypass = std::ptr::eq(dialer, &self.bypass), "Selected per-host dialer");
      dialer.dial(network, address).await
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::PerHost;
  use crate::common::{
    dialer::{ArcDialer, Dialer},
    direct::Direct,
    error::DialerError,
    protocol::socks::tests::PipeDialer,
  };

  fn per_host(rules: &str) -> PerHost {
    let mut per_host = PerHost::new(Direct::shared(), Direct::shared());
    per_host.add_from_str(rules);
    per_host
  }

  #[test]
  fn rule_matching() {
    let rules = per_host("localhost, 127.0.0.1, 10.0.0.0/8, *.example.com, .internal, ::1, fe80::/10");
    assert!(rules.bypasses("localhost"));
    assert!(rules.bypasses("LOCALHOST."));
    assert!(rules.bypasses("127.0.0.1"));
    assert!(!rules.bypasses("127.0.0.2"));
    assert!(rules.bypasses("10.20.30.40"));
    assert!(rules.bypasses("www.example.com"));
    assert!(rules.bypasses("example.com"));
    assert!(!rules.bypasses("badexample.com"));
    assert!(rules.bypasses("db.internal"));
    assert!(rules.bypasses("internal"));
    assert!(rules.bypasses("::1"));
    assert!(rules.bypasses("[fe80::1]"));
    assert!(!rules.bypasses("example.org"));
  }

  #[test]
  fn malformed_rules_are_ignored() {
    let rules = per_host("10.0.0.0/99,,  ,example.org");
    assert!(!rules.bypasses("10.0.0.1"));
    assert!(rules.bypasses("example.org"));
  }

  #[tokio::test]
  async fn dial_selects_dialer_by_host() {
    let default = PipeDialer::with_peer(tokio::io::duplex(8).0);
    let bypass = PipeDialer::with_peer(tokio::io::duplex(8).0);
    let mut per_host = PerHost::new(
      Arc::clone(&default) as ArcDialer,
      Arc::clone(&bypass) as ArcDialer,
    );
    per_host.add_from_str("*.corp.example");
    per_host.dial("tcp", "git.corp.example:22").await.unwrap();
    per_host.dial("tcp", "example.org:443").await.unwrap();
    assert_eq!(
      bypass.dialed.lock().unwrap().as_slice(),
      &[(String::from("tcp"), String::from("git.corp.example:22"))]
    );
    assert_eq!(
      default.dialed.lock().unwrap().as_slice(),
      &[(String::from("tcp"), String::from("example.org:443"))]
    );
  }

  #[tokio::test]
  async fn dial_requires_port() {
    let per_host = per_host("");
    assert!(matches!(
      per_host.dial("tcp", "example.org").await,
      Err(DialerError::InvalidAddress { .. })
    ));
  }
}
