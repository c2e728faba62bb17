//! Host matching.
//!
//! # Responsibilities
//! - Strip ports from request hosts (IPv6 literals included)
//! - Normalize hostnames (lowercase, trailing dot trimmed)
//! - Decide whether a host is TLS-capable from certificate SAN names
//!
//! # Design Decisions
//! - A SAN made only of hostname characters matches exactly
//! - A `*.` SAN matches exactly one extra leading label
//! - Anything else is compiled as an unanchored regular expression; a pattern
//!   only counts when it compiled AND matched, bad patterns are dropped at startup

use std::collections::HashSet;

use regex::Regex;

/// Remove a trailing `:port` from a host, handling `[v6]:port` literals.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Lowercase and drop a trailing root dot.
pub fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_plain_hostname(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_')
}

/// Set of hosts that can be served over TLS.
#[derive(Debug, Default)]
pub struct TlsHostMatcher {
    exact: HashSet<String>,
    wildcard_suffixes: Vec<String>,
    patterns: Vec<Regex>,
}

impl TlsHostMatcher {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for host in hosts {
            matcher.insert(host.as_ref());
        }
        matcher
    }

    fn insert(&mut self, host: &str) {
        if host.is_empty() {
            return;
        }

        if is_plain_hostname(host) {
            self.exact.insert(normalize_host(host));
            return;
        }

        if let Some(parent) = host.strip_prefix("*.") {
            if is_plain_hostname(parent) {
                self.wildcard_suffixes
                    .push(format!(".{}", normalize_host(parent)));
                return;
            }
        }

        match Regex::new(host) {
            Ok(pattern) => self.patterns.push(pattern),
            Err(e) => {
                tracing::warn!(pattern = %host, error = %e, "Ignoring TLS host pattern that does not compile");
            }
        }
    }

    /// Whether `host` (already port-stripped and normalized) is TLS-capable.
    pub fn matches(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        if self.exact.contains(host) {
            return true;
        }
        let wildcard = self.wildcard_suffixes.iter().any(|suffix| {
            host.strip_suffix(suffix.as_str())
                .is_some_and(|label| !label.is_empty() && !label.contains('.'))
        });
        wildcard || self.patterns.iter().any(|pattern| pattern.is_match(host))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard_suffixes.is_empty() && self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard_suffixes.len() + self.patterns.len()
    }
}
