//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate listen addresses and required endpoints
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>

use crate::config::schema::ProxyConfig;
use crate::net::listener::normalize_address;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

fn check_address(field: &'static str, address: &str, errors: &mut Vec<ValidationError>) {
    let address = normalize_address(address.trim());
    let valid = match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if !valid {
        errors.push(ValidationError::new(
            field,
            format!("{:?} is not a host:port address", address),
        ));
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address("listener.http_address", &config.listener.http_address, &mut errors);
    if config.listener.cert_dir.is_some() {
        check_address("listener.https_address", &config.listener.https_address, &mut errors);
    }

    if config.discovery.etcd_endpoint.trim().is_empty() {
        errors.push(ValidationError::new("discovery.etcd_endpoint", "must not be empty"));
    }
    if config.discovery.directory.trim().trim_matches('/').is_empty() {
        errors.push(ValidationError::new("discovery.directory", "must name a directory"));
    }
    if config.discovery.retry_interval_ms == 0 {
        errors.push(ValidationError::new("discovery.retry_interval_ms", "must be greater than 0"));
    }

    if config.runtime.endpoint.trim().is_empty() {
        errors.push(ValidationError::new("runtime.endpoint", "must not be empty"));
    }

    if config.observability.log_level.trim().is_empty() {
        errors.push(ValidationError::new("observability.log_level", "must not be empty"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
