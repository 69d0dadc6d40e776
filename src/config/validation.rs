//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate listen addresses and reject duplicates
//! - Check that TLS material exists
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GraceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system, and again before every handoff

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::GraceConfig;
use crate::net::{ListenAddr, NetworkKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no servers configured")]
    NoServers,

    #[error("server {server}: invalid address {address}: {reason}")]
    InvalidAddress {
        server: String,
        address: String,
        reason: String,
    },

    #[error("address {0} is used more than once")]
    DuplicateAddress(String),

    #[error("server name {0} is used more than once")]
    DuplicateName(String),

    #[error("server {server}: TLS file {path} does not exist")]
    MissingTlsFile { server: String, path: String },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GraceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.servers.is_empty() {
        errors.push(ValidationError::NoServers);
    }

    let mut names = HashSet::new();
    let mut addresses: Vec<ListenAddr> = Vec::new();
    let mut check_address = |server: &str, address: &str, errors: &mut Vec<ValidationError>| {
        match ListenAddr::resolve(NetworkKind::Tcp, address) {
            Ok(addr) => {
                // Port 0 picks a free port, never a conflict.
                let ephemeral = matches!(&addr, ListenAddr::Inet(a) if a.port() == 0);
                if !ephemeral && addresses.iter().any(|seen| seen.same_as(&addr)) {
                    errors.push(ValidationError::DuplicateAddress(address.to_string()));
                }
                addresses.push(addr);
            }
            Err(e) => errors.push(ValidationError::InvalidAddress {
                server: server.to_string(),
                address: address.to_string(),
                reason: e.to_string(),
            }),
        }
    };

    for server in &config.servers {
        let name = server.display_name();
        if !names.insert(name) {
            errors.push(ValidationError::DuplicateName(name.to_string()));
        }

        check_address(name, &server.address, &mut errors);

        if let Some(tls) = &server.tls {
            for path in [&tls.cert_path, &tls.key_path] {
                if !Path::new(path).exists() {
                    errors.push(ValidationError::MissingTlsFile {
                        server: name.to_string(),
                        path: path.clone(),
                    });
                }
            }
        }
    }

    if let Some(metrics) = &config.observability.metrics_address {
        check_address("metrics", metrics, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
