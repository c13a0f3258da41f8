//! Pluggable middleware.
//!
//! # Data Flow
//! ```text
//! MiddlewareRegistry (tag → MiddlewareSpec)
//!     → spec.rs (from_record / from_flags → Arc<dyn Middleware>)
//!     → chain.rs (wrap terminal handler in configuration order)
//!     → BoxHandler served by http::server
//! ```

pub mod backend_header;
pub mod chain;
pub mod registry;
pub mod spec;

pub use backend_header::{BackendHeader, BackendHeaderLayer, BackendHeaderService};
pub use chain::{build_chain, ChainError};
pub use registry::{MiddlewareRegistry, RegistryError};
pub use spec::{BoxHandler, FlagKind, FlagSpec, Middleware, MiddlewareError, MiddlewareSpec};
