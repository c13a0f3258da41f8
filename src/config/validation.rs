//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Middleware types are checked against the registry at chain assembly,
//!   not here

use std::net::SocketAddr;

use axum::http::uri::Authority;
use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address `{0}` is not a socket address")]
    BindAddress(String),

    #[error("upstream.address `{0}` is not a valid host:port")]
    UpstreamAddress(String),

    #[error("timeouts.request_secs must be greater than 0")]
    RequestTimeout,

    #[error("middlewares[{0}] has an empty type")]
    MiddlewareType(usize),
}

/// Check a parsed config, collecting every problem.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    let upstream = config.upstream.address.trim();
    if upstream.is_empty() || upstream.parse::<Authority>().is_err() {
        errors.push(ValidationError::UpstreamAddress(
            config.upstream.address.clone(),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::RequestTimeout);
    }

    for (i, middleware) in config.middlewares.iter().enumerate() {
        if middleware.type_tag.trim().is_empty() {
            errors.push(ValidationError::MiddlewareType(i));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
