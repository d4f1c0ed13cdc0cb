// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! OpenSSH `known_hosts` loading and host key verification

use base64::Engine;
use hmac::{Hmac, Mac};
use russh_keys::key::PublicKey;
use sha1::Sha1;
use std::path::{Path, PathBuf};

use crate::common::error::{ConfigurationError, EstablishmentError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
  None,
  Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
  Glob(String),
  /// `|1|salt|hash`: HMAC-SHA1 of the lookup name keyed by the salt
  Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

impl HostPattern {
  fn parse(raw: &str) -> Result<Self, &'static str> {
    let hashed = match raw.strip_prefix("|1|") {
      Some(hashed) => hashed,
      None => return Ok(HostPattern::Glob(raw.to_ascii_lowercase())),
    };
    let (salt, hash) = hashed
      .split_once('|')
      .ok_or("hashed host is missing its hash")?;
    let engine = base64::engine::general_purpose::STANDARD;
    Ok(HostPattern::Hashed {
      salt: engine
        .decode(salt)
        .map_err(|_| "hashed host salt is not valid base64")?,
      hash: engine
        .decode(hash)
        .map_err(|_| "hashed host hash is not valid base64")?,
    })
  }

  fn matches(&self, name: &str) -> bool {
    match self {
      HostPattern::Glob(pattern) => wildcard_match(pattern.as_bytes(), name.as_bytes()),
      HostPattern::Hashed { salt, hash } => match Hmac::<Sha1>::new_from_slice(salt) {
        Ok(mac) => mac.chain_update(name.as_bytes()).verify_slice(hash).is_ok(),
        Err(_) => false,
      },
    }
  }
}

#[derive(Debug, Clone)]
struct Entry {
  path: PathBuf,
  line: usize,
  marker: Marker,
  /// Patterns paired with whether they are negated
  patterns: Vec<(bool, HostPattern)>,
  key: PublicKey,
}

/// Host keys loaded from one or more `known_hosts` files
///
/// Files are read and validated when loaded; verification never touches the filesystem.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
  entries: Vec<Entry>,
  files: Vec<PathBuf>,
}

impl KnownHosts {
  /// Reads and validates each file, failing on the first unreadable file or malformed line
  pub fn load<I, P>(paths: I) -> Result<Self, ConfigurationError>
  where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
  {
    let mut known_hosts = KnownHosts::default();
    for path in paths {
      let path = path.as_ref();
      let contents = std::fs::read_to_string(path).map_err(|e| {
        ConfigurationError::KnownHostsUnreadable {
          path: path.to_path_buf(),
          source: e.into(),
        }
      })?;
      known_hosts.add_contents(path, &contents)?;
      known_hosts.files.push(path.to_path_buf());
    }
    Ok(known_hosts)
  }

  fn add_contents(&mut self, path: &Path, contents: &str) -> Result<(), ConfigurationError> {
    for (index, raw) in contents.lines().enumerate() {
      let line = index + 1;
      let malformed = |reason: &str| ConfigurationError::KnownHosts {
        path: path.to_path_buf(),
        line,
        reason: reason.to_string(),
      };
      let trimmed = raw.trim();
      if trimmed.is_empty() || trimmed.starts_with('#') {
        continue;
      }
      let mut fields = trimmed.split_whitespace().peekable();
      let marker = match fields.peek().copied() {
        Some("@revoked") => {
          fields.next();
          Marker::Revoked
        }
        Some("@cert-authority") => {
          tracing::debug!(?path, line, "Skipping certificate authority entry");
          continue;
        }
        Some(other) if other.starts_with('@') => return Err(malformed("unknown marker")),
        _ => Marker::None,
      };
      let hosts = fields.next().ok_or_else(|| malformed("missing host patterns"))?;
      let key_type = fields.next().ok_or_else(|| malformed("missing key type"))?;
      let key_data = fields.next().ok_or_else(|| malformed("missing key data"))?;
      let key = match russh_keys::parse_public_key_base64(key_data) {
        Ok(key) => key,
        Err(e) => {
          if base64::engine::general_purpose::STANDARD
            .decode(key_data)
            .is_err()
          {
            return Err(malformed("key data is not valid base64"));
          }
          // Well-formed entries for key types this client cannot use are ignored, not rejected
          tracing::debug!(?path, line, key_type, error = %e, "Skipping unsupported host key");
          continue;
        }
      };
      let patterns = hosts
        .split(',')
        .map(|raw| match raw.strip_prefix('!') {
          Some(negated) => HostPattern::parse(negated).map(|p| (true, p)),
          None => HostPattern::parse(raw).map(|p| (false, p)),
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(malformed)?;
      self.entries.push(Entry {
        path: path.to_path_buf(),
        line,
        marker,
        patterns,
        key,
      });
    }
    Ok(())
  }

  pub fn files(&self) -> &[PathBuf] {
    &self.files
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Checks a server key presented by `host:port`
  ///
  /// Revoked keys and keys differing from a known entry for the host are mismatches;
  /// hosts without any entry are unknown.
  pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), EstablishmentError> {
    let lookup = host_lookup_name(host, port);
    let mut mismatch: Option<&Entry> = None;
    let mut accepted = false;
    for entry in self.entries.iter() {
      if entry.marker == Marker::Revoked {
        if entry.key == *key {
          return Err(EstablishmentError::HostKeyMismatch {
            host: lookup,
            path: entry.path.clone(),
            line: entry.line,
          });
        }
        continue;
      }
      if !patterns_match(&entry.patterns, &lookup) {
        continue;
      }
      if entry.key == *key {
        accepted = true;
      } else if mismatch.is_none() {
        mismatch = Some(entry);
      }
    }
    match (accepted, mismatch) {
      (true, _) => Ok(()),
      (false, Some(entry)) => Err(EstablishmentError::HostKeyMismatch {
        host: lookup,
        path: entry.path.clone(),
        line: entry.line,
      }),
      (false, None) => Err(EstablishmentError::UnknownHostKey { host: lookup }),
    }
  }
}

/// The name under which OpenSSH records a host; non-default ports are bracketed
fn host_lookup_name(host: &str, port: u16) -> String {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if port == 22 {
    host.to_ascii_lowercase()
  } else {
    format!("[{}]:{}", host.to_ascii_lowercase(), port)
  }
}

fn patterns_match(patterns: &[(bool, HostPattern)], name: &str) -> bool {
  let mut matched = false;
  for (negated, pattern) in patterns {
    if pattern.matches(name) {
      if *negated {
        return false;
      }
      matched = true;
    }
  }
  matched
}

/// Glob matching supporting `*` and `?`
fn wildcard_match(pattern: &[u8], name: &[u8]) -> bool {
  let (mut p, mut n) = (0usize, 0usize);
  let mut star: Option<(usize, usize)> = None;
  while n < name.len() {
    if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == name[n]) {
      p += 1;
      n += 1;
    } else if p < pattern.len() && pattern[p] == b'*' {
      star = Some((p, n));
      p += 1;
    } else if let Some((star_p, star_n)) = star {
      p = star_p + 1;
      n = star_n + 1;
      star = Some((star_p, star_n + 1));
    } else {
      return false;
    }
  }
  while p < pattern.len() && pattern[p] == b'*' {
    p += 1;
  }
  p == pattern.len()
}

#[cfg(test)]
pub(crate) mod tests {
  use std::io::Write;

  use super::{wildcard_match, KnownHosts};
  use crate::common::error::{ConfigurationError, EstablishmentError};

  pub(crate) const BASEPOINT_KEY: &str =
    "AAAAC3NzaC1lZDI1NTE5AAAAIFhmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZm";
  pub(crate) const IDENTITY_KEY: &str =
    "AAAAC3NzaC1lZDI1NTE5AAAAIAEAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

  pub(crate) fn known_hosts_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
  }

  #[test]
  fn wildcards() {
    assert!(wildcard_match(b"*.example.com", b"proxy.example.com"));
    assert!(wildcard_match(b"proxy?", b"proxy1"));
    assert!(!wildcard_match(b"*.example.com", b"example.com"));
    assert!(wildcard_match(b"*", b""));
  }

  #[test]
  fn verify_known_key() {
    let file = known_hosts_file(&format!(
      "# comment\n\nproxyhost,10.0.0.1 ssh-ed25519 {}\n[proxyhost]:2222 ssh-ed25519 {}\n",
      BASEPOINT_KEY, IDENTITY_KEY
    ));
    let known = KnownHosts::load([file.path()]).unwrap();
    assert_eq!(known.len(), 2);
    let basepoint = russh_keys::parse_public_key_base64(BASEPOINT_KEY).unwrap();
    let identity = russh_keys::parse_public_key_base64(IDENTITY_KEY).unwrap();

    known.verify("proxyhost", 22, &basepoint).unwrap();
    known.verify("PROXYHOST", 22, &basepoint).unwrap();
    known.verify("proxyhost", 2222, &identity).unwrap();
    assert!(matches!(
      known.verify("proxyhost", 22, &identity),
      Err(EstablishmentError::HostKeyMismatch { line: 3, .. })
    ));
    assert!(matches!(
      known.verify("elsewhere", 22, &basepoint),
      Err(EstablishmentError::UnknownHostKey { .. })
    ));
  }

  #[test]
  fn negated_patterns_exclude_hosts() {
    let file = known_hosts_file(&format!(
      "*.example.com,!bastion.example.com ssh-ed25519 {}\n",
      BASEPOINT_KEY
    ));
    let known = KnownHosts::load([file.path()]).unwrap();
    let key = russh_keys::parse_public_key_base64(BASEPOINT_KEY).unwrap();
    known.verify("proxy.example.com", 22, &key).unwrap();
    assert!(matches!(
      known.verify("bastion.example.com", 22, &key),
      Err(EstablishmentError::UnknownHostKey { .. })
    ));
  }

  #[test]
  fn revoked_keys_are_rejected() {
    let file = known_hosts_file(&format!(
      "@revoked * ssh-ed25519 {key}\nproxyhost ssh-ed25519 {key}\n",
      key = BASEPOINT_KEY
    ));
    let known = KnownHosts::load([file.path()]).unwrap();
    let key = russh_keys::parse_public_key_base64(BASEPOINT_KEY).unwrap();
    assert!(matches!(
      known.verify("proxyhost", 22, &key),
      Err(EstablishmentError::HostKeyMismatch { line: 1, .. })
    ));
  }

  #[test]
  fn malformed_lines_fail_loading() {
    let file = known_hosts_file("proxyhost ssh-ed25519\n");
    assert!(matches!(
      KnownHosts::load([file.path()]),
      Err(ConfigurationError::KnownHosts { line: 1, .. })
    ));
    let file = known_hosts_file("proxyhost ssh-ed25519 not*base64!\n");
    assert!(matches!(
      KnownHosts::load([file.path()]),
      Err(ConfigurationError::KnownHosts { line: 1, .. })
    ));
  }

  #[test]
  fn hashed_hosts_match_their_name() {
    const HASHED_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAILIG2T/B0l0gaqj3puu510tu9N1OkQ4znY3LYuEm5zCF";
    let file = known_hosts_file(&format!(
      "|1|O33ESRMWPVkMYIwJ1Uw+n877jTo=|nuuC5vEqXlEZ/8BXQR7m619W6Ak= ssh-ed25519 {}\n",
      HASHED_KEY
    ));
    let known = KnownHosts::load([file.path()]).unwrap();
    let key = russh_keys::parse_public_key_base64(HASHED_KEY).unwrap();
    known.verify("example.com", 22, &key).unwrap();
    known.verify("Example.COM", 22, &key).unwrap();
    assert!(matches!(
      known.verify("example.com", 2222, &key),
      Err(EstablishmentError::UnknownHostKey { .. })
    ));
    assert!(matches!(
      known.verify("example.org", 22, &key),
      Err(EstablishmentError::UnknownHostKey { .. })
    ));
    let other = russh_keys::parse_public_key_base64(BASEPOINT_KEY).unwrap();
    assert!(matches!(
      known.verify("example.com", 22, &other),
      Err(EstablishmentError::HostKeyMismatch { line: 1, .. })
    ));
  }

  #[test]
  fn malformed_hashed_hosts_fail_loading() {
    let file = known_hosts_file(&format!("|1|not*base64|AAAA ssh-ed25519 {}\n", BASEPOINT_KEY));
    assert!(matches!(
      KnownHosts::load([file.path()]),
      Err(ConfigurationError::KnownHosts { line: 1, .. })
    ));
  }

  #[test]
  fn missing_files_fail_loading() {
    assert!(matches!(
      KnownHosts::load(["/nonexistent/proxywire/known_hosts"]),
      Err(ConfigurationError::KnownHostsUnreadable { .. })
    ));
  }
}
