//! Host-owned middleware registry.
//!
//! # Responsibilities
//! - Map type tags to [`MiddlewareSpec`]s
//! - Reject duplicate and malformed tags at registration time
//! - Describe registered types for CLI help
//!
//! # Design Decisions
//! - Owned by whoever assembles the chain and passed explicitly; there is no
//!   process-wide registry
//! - A rejected registration leaves the registry unchanged

use std::collections::BTreeMap;

use thiserror::Error;

use crate::http::middleware::backend_header;
use crate::http::middleware::spec::MiddlewareSpec;

/// Registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("middleware type `{0}` is already registered")]
    Duplicate(String),

    #[error("invalid middleware type `{0}`: expected lowercase letters, digits, `-` or `_`")]
    InvalidType(String),

    #[error("unknown middleware type `{0}`")]
    NotFound(String),
}

/// Mapping from type tag to middleware spec.
#[derive(Debug, Default)]
pub struct MiddlewareRegistry {
    specs: BTreeMap<&'static str, MiddlewareSpec>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every middleware type this crate ships.
    pub fn with_builtins() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.add_spec(backend_header::spec())?;
        registry.add_spec(backend_header::legacy_spec())?;
        Ok(registry)
    }

    /// Register a spec under its type tag.
    pub fn add_spec(&mut self, spec: MiddlewareSpec) -> Result<(), RegistryError> {
        if !is_valid_type(spec.type_tag) {
            return Err(RegistryError::InvalidType(spec.type_tag.to_string()));
        }
        if self.specs.contains_key(spec.type_tag) {
            return Err(RegistryError::Duplicate(spec.type_tag.to_string()));
        }

        tracing::debug!(
            type_tag = spec.type_tag,
            flags = spec.flags.len(),
            "Middleware type registered"
        );
        self.specs.insert(spec.type_tag, spec);
        Ok(())
    }

    pub fn get(&self, type_tag: &str) -> Option<&MiddlewareSpec> {
        self.specs.get(type_tag)
    }

    /// Like [`get`](Self::get), but unknown tags are an error.
    pub fn lookup(&self, type_tag: &str) -> Result<&MiddlewareSpec, RegistryError> {
        self.get(type_tag)
            .ok_or_else(|| RegistryError::NotFound(type_tag.to_string()))
    }

    /// Registered specs, sorted by tag.
    pub fn specs(&self) -> impl Iterator<Item = &MiddlewareSpec> {
        self.specs.values()
    }

    pub fn types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// One line per registered type: tag followed by its flags.
    pub fn describe(&self) -> String {
        self.specs()
            .map(|spec| {
                let flags: Vec<String> = spec
                    .flags
                    .iter()
                    .map(|flag| format!("--{} <{}> (default {})", flag.name, flag.kind, flag.default))
                    .collect();
                format!("{:<16}{}", spec.type_tag, flags.join(" "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn is_valid_type(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}
