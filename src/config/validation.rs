//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, sizes > 0)
//! - Detect duplicate or malformed listener rows
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: WorkerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::WorkerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("coordinator.socket_path must not be empty")]
    EmptySocketPath,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("coordinator.retry_base_delay_ms ({base}) exceeds retry_max_delay_ms ({max})")]
    BackoffRange { base: u64, max: u64 },

    #[error("listener id {0} must be positive")]
    ListenerId(i32),

    #[error("listener {id} has invalid address {address:?}")]
    ListenerAddress { id: i32, address: String },

    #[error("listener {id} binds {address} more than once")]
    DuplicateAddress { id: i32, address: String },

    #[error("observability.metrics_address {0:?} is not a socket address")]
    MetricsAddress(String),
}

/// Check a parsed configuration for semantic problems.
pub fn validate_config(config: &WorkerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.coordinator.socket_path.trim().is_empty() {
        errors.push(ValidationError::EmptySocketPath);
    }
    if config.coordinator.poll_interval_ms == 0 {
        errors.push(ValidationError::Zero { field: "coordinator.poll_interval_ms" });
    }
    if config.coordinator.retry_base_delay_ms > config.coordinator.retry_max_delay_ms {
        errors.push(ValidationError::BackoffRange {
            base: config.coordinator.retry_base_delay_ms,
            max: config.coordinator.retry_max_delay_ms,
        });
    }
    if config.http.max_body_size == 0 {
        errors.push(ValidationError::Zero { field: "http.max_body_size" });
    }
    if config.http.idle_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "http.idle_timeout_secs" });
    }
    if config.http.upstream_connect_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "http.upstream_connect_timeout_secs" });
    }
    if config.dispatch.reload_retry_ms == 0 {
        errors.push(ValidationError::Zero { field: "dispatch.reload_retry_ms" });
    }

    let mut seen = HashSet::new();
    for listener in &config.listeners {
        if listener.id <= 0 {
            errors.push(ValidationError::ListenerId(listener.id));
        }
        match listener.address.parse::<SocketAddr>() {
            Ok(addr) => {
                if !seen.insert(addr) {
                    errors.push(ValidationError::DuplicateAddress {
                        id: listener.id,
                        address: listener.address.clone(),
                    });
                }
            }
            Err(_) => errors.push(ValidationError::ListenerAddress {
                id: listener.id,
                address: listener.address.clone(),
            }),
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ListenerEntry;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&WorkerConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = WorkerConfig::default();
        config.coordinator.socket_path = "  ".into();
        config.http.max_body_size = 0;
        config.listeners.push(ListenerEntry { id: 0, address: "nowhere".into() });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::EmptySocketPath));
        assert!(errors.contains(&ValidationError::ListenerId(0)));
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let mut config = WorkerConfig::default();
        config.listeners.push(ListenerEntry { id: 1, address: "127.0.0.1:8080".into() });
        config.listeners.push(ListenerEntry { id: 2, address: "127.0.0.1:8080".into() });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DuplicateAddress { id: 2, address: "127.0.0.1:8080".into() }]
        );
    }
}
