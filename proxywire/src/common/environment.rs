// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use super::{
  dialer::{ArcDialer, SystemResolver},
  direct::Direct,
  per_host::PerHost,
  registry::SchemeRegistry,
};

/// Selects a dialer from the `all_proxy` and `no_proxy` environment variables
///
/// An unset or unusable `all_proxy` yields a direct dialer. Upper-case
/// variants are consulted when the lower-case variable is unset.
pub fn from_environment(registry: &SchemeRegistry) -> ArcDialer {
  from_variables(registry, |name| std::env::var(name).ok())
}

pub(crate) fn from_variables<F>(registry: &SchemeRegistry, lookup: F) -> ArcDialer
where
  F: Fn(&str) -> Option<String>,
{
  let variable = |lower: &str, upper: &str| {
    lookup(lower)
      .or_else(|| lookup(upper))
      .filter(|v| !v.trim().is_empty())
  };
  let all_proxy = match variable("all_proxy", "ALL_PROXY") {
    Some(all_proxy) => all_proxy,
    None => {
      tracing::trace!("No proxy configured in the environment");
      return Direct::shared();
    }
  };
  let proxy = match registry.from_url_str(all_proxy.trim(), Direct::shared(), SystemResolver::shared()) {
    Ok(proxy) => proxy,
    Err(e) => {
      tracing::warn!(error = %e, "Ignoring unusable all_proxy; connecting directly");
      return Direct::shared();
    }
  };
  match variable("no_proxy", "NO_PROXY") {
    Some(no_proxy) => {
      let mut per_host = PerHost::new(proxy, Direct::shared());
      per_host.add_from_str(&no_proxy);
      Arc::new(per_host)
    }
    None => proxy,
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::from_variables;
  use crate::common::{
    direct::Direct, per_host::PerHost, protocol::socks::Socks5, registry::SchemeRegistry,
  };

  fn resolve(vars: &[(&str, &str)]) -> crate::common::dialer::ArcDialer {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    from_variables(&SchemeRegistry::with_builtins(), |name| vars.get(name).cloned())
  }

  #[test]
  fn unset_environment_is_direct() {
    assert!(resolve(&[]).downcast_arc::<Direct>().is_ok());
  }

  #[test]
  fn unusable_proxy_is_direct() {
    assert!(resolve(&[("all_proxy", "gopher://proxy:70")])
      .downcast_arc::<Direct>()
      .is_ok());
    assert!(resolve(&[("all_proxy", "::not a url::")])
      .downcast_arc::<Direct>()
      .is_ok());
  }

  #[test]
  fn proxy_without_exclusions() {
    assert!(resolve(&[("ALL_PROXY", "socks5://proxy:1080")])
      .downcast_arc::<Socks5>()
      .is_ok());
  }

  #[test]
  fn exclusions_wrap_proxy() {
    let dialer = resolve(&[
      ("all_proxy", "socks5://proxy:1080"),
      ("NO_PROXY", "localhost,.corp.example"),
    ]);
    let per_host = dialer.downcast_arc::<PerHost>().unwrap();
    assert!(per_host.bypasses("localhost"));
    assert!(per_host.bypasses("build.corp.example"));
    assert!(!per_host.bypasses("example.org"));
  }
}
