//! TLS certificate loading and SNI selection.
//!
//! # Responsibilities
//! - Walk a certificate directory tree collecting `<name>.crt`/`<name>.key` pairs
//! - Derive the DNS names the loaded certificates cover
//! - Build the rustls server configuration used by the HTTPS listener
//!
//! # Design Decisions
//! - Loading is best-effort: a malformed pair or an unreadable subdirectory is
//!   logged and skipped; only an unreadable root is fatal
//! - Certificates are loaded once at startup, never reloaded

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use x509_parser::extensions::GeneralName;

const CERT_SUFFIX: &str = ".crt";
const KEY_SUFFIX: &str = ".key";

/// Errors raised while loading certificates.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to read certificate directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("unsupported private key in {path}: {source}")]
    Key {
        path: PathBuf,
        source: rustls::Error,
    },

    #[error("private key in {0} does not match its certificate")]
    KeyMismatch(PathBuf),

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// One loaded certificate chain and its private key.
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    name: PathBuf,
    key: Arc<CertifiedKey>,
}

impl CertificateEntry {
    /// Path of the pair without extension, e.g. `/certs/site/example`.
    pub fn name(&self) -> &Path {
        &self.name
    }

    /// Certificate chain, leaf first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.key.cert
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.key)
    }
}

/// Recursively load every certificate pair below `root`.
pub fn load_certificates(root: &Path) -> Result<Vec<CertificateEntry>, CertError> {
    let dir = fs::read_dir(root).map_err(|source| CertError::ReadDir {
        path: root.to_path_buf(),
        source,
    })?;

    // Sorted so the default certificate does not depend on enumeration order.
    let mut children: Vec<_> = dir.filter_map(Result::ok).collect();
    children.sort_by_key(|entry| entry.file_name());

    let mut processed = HashSet::new();
    let mut entries = Vec::new();

    for child in children {
        let path = child.path();
        let Ok(file_type) = child.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            match load_certificates(&path) {
                Ok(inner) => entries.extend(inner),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping certificate directory");
                }
            }
            continue;
        }

        let file_name = child.file_name().to_string_lossy().into_owned();
        let Some(base) = pair_base_name(&file_name) else {
            continue;
        };
        if !processed.insert(base.to_string()) {
            continue;
        }

        let name = root.join(base);
        match load_pair(&name) {
            Ok(entry) => {
                tracing::debug!(pair = %name.display(), "Certificate pair loaded");
                entries.push(entry);
            }
            Err(e) => {
                tracing::warn!(pair = %name.display(), error = %e, "Skipping malformed certificate pair");
            }
        }
    }

    Ok(entries)
}

/// Base name shared by a `.crt`/`.key` pair, if `file_name` is one of them.
fn pair_base_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(CERT_SUFFIX)
        .or_else(|| file_name.strip_suffix(KEY_SUFFIX))
        .filter(|base| !base.is_empty())
}

fn load_pair(name: &Path) -> Result<CertificateEntry, CertError> {
    let cert_path = with_suffix(name, CERT_SUFFIX);
    let key_path = with_suffix(name, KEY_SUFFIX);

    let chain = read_chain(&cert_path)?;
    let key_der = {
        let mut reader = BufReader::new(open(&key_path)?);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|source| CertError::Read {
                path: key_path.clone(),
                source,
            })?
            .ok_or_else(|| CertError::NoPrivateKey(key_path.clone()))?
    };

    let signing_key = ring::sign::any_supported_type(&key_der).map_err(|source| CertError::Key {
        path: key_path.clone(),
        source,
    })?;

    let key = CertifiedKey::new(chain, signing_key);
    match key.keys_match() {
        // The signing key cannot report its public half; nothing to compare.
        Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
        Err(_) => return Err(CertError::KeyMismatch(key_path.clone())),
    }

    Ok(CertificateEntry {
        name: name.to_path_buf(),
        key: Arc::new(key),
    })
}

fn read_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = BufReader::new(open(path)?);
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if chain.is_empty() {
        return Err(CertError::NoCertificate(path.to_path_buf()));
    }
    Ok(chain)
}

fn open(path: &Path) -> Result<fs::File, CertError> {
    fs::File::open(path).map_err(|source| CertError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn with_suffix(name: &Path, suffix: &str) -> PathBuf {
    let mut raw = name.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// DNS SAN entries of one DER certificate.
pub fn dns_names(der: &[u8]) -> Result<Vec<String>, CertError> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(der).map_err(|e| CertError::Parse(e.to_string()))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| CertError::Parse(e.to_string()))?;

    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

/// Union of the DNS names covered by `entries`, empty names skipped.
///
/// A chain segment that fails to parse ends collection for that entry only.
pub fn derive_hosts(entries: &[CertificateEntry]) -> BTreeSet<String> {
    let mut hosts = BTreeSet::new();
    for entry in entries {
        for segment in entry.chain() {
            match dns_names(segment.as_ref()) {
                Ok(names) => collect_names(&mut hosts, names),
                Err(e) => {
                    tracing::warn!(pair = %entry.name().display(), error = %e, "Unparseable certificate in chain");
                    break;
                }
            }
        }
    }
    hosts
}

fn collect_names(hosts: &mut BTreeSet<String>, names: impl IntoIterator<Item = String>) {
    hosts.extend(names.into_iter().filter(|name| !name.is_empty()));
}

/// Picks a certificate by SNI: exact SAN, then `*.` wildcard, then the first
/// loaded certificate.
#[derive(Debug, Default)]
pub struct SniResolver {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new(entries: &[CertificateEntry]) -> Self {
        let mut by_name = HashMap::new();
        for entry in entries {
            let Some(leaf) = entry.chain().first() else {
                continue;
            };
            let names = dns_names(leaf.as_ref()).unwrap_or_default();
            for name in names.into_iter().filter(|name| !name.is_empty()) {
                by_name
                    .entry(name.to_ascii_lowercase())
                    .or_insert_with(|| entry.certified_key());
            }
        }

        Self {
            by_name,
            fallback: entries.first().map(CertificateEntry::certified_key),
        }
    }

    pub fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = server_name else {
            return self.fallback.clone();
        };
        let server_name = server_name.to_ascii_lowercase();

        if let Some(key) = self.by_name.get(&server_name) {
            return Some(Arc::clone(key));
        }
        if let Some((_, parent)) = server_name.split_once('.') {
            if let Some(key) = self.by_name.get(&format!("*.{}", parent)) {
                return Some(Arc::clone(key));
            }
        }
        self.fallback.clone()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.lookup(client_hello.server_name())
    }
}

/// Build the HTTPS listener's rustls configuration from the loaded pairs.
pub fn server_config(entries: &[CertificateEntry]) -> Result<Arc<ServerConfig>, CertError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(entries)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
