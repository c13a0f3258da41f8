//! Middleware chain assembly.
//!
//! Entries are applied in configuration order: the first entry sees the
//! request first and the response last.

use std::sync::Arc;

use thiserror::Error;

use crate::config::MiddlewareConfig;
use crate::http::middleware::registry::{MiddlewareRegistry, RegistryError};
use crate::http::middleware::spec::{BoxHandler, Middleware, MiddlewareError};

/// Failure to assemble a chain. Fatal to that chain only.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("middleware `{type_tag}`: {source}")]
    Middleware {
        type_tag: String,
        #[source]
        source: MiddlewareError,
    },
}

/// Build every configured middleware without wiring them yet.
pub fn build_middlewares(
    registry: &MiddlewareRegistry,
    entries: &[MiddlewareConfig],
) -> Result<Vec<Arc<dyn Middleware>>, ChainError> {
    entries
        .iter()
        .map(|entry| -> Result<Arc<dyn Middleware>, ChainError> {
            let spec = registry.lookup(&entry.type_tag)?;
            let middleware = spec.build_from_record(&entry.config).map_err(|source| {
                ChainError::Middleware {
                    type_tag: entry.type_tag.clone(),
                    source,
                }
            })?;
            tracing::info!(
                type_tag = %entry.type_tag,
                middleware = %middleware,
                "Middleware configured"
            );
            Ok(middleware)
        })
        .collect()
}

/// Wrap `terminal` with the configured middlewares.
pub fn build_chain(
    registry: &MiddlewareRegistry,
    entries: &[MiddlewareConfig],
    terminal: BoxHandler,
) -> Result<BoxHandler, ChainError> {
    let middlewares = build_middlewares(registry, entries)?;
    Ok(middlewares
        .iter()
        .rev()
        .fold(terminal, |next, middleware| middleware.new_handler(next)))
}
