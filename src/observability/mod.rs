//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields
//!
//! Consumers:
//!     → logging.rs subscriber (stderr, pretty or JSON)
//!     → tower_http TraceLayer spans per request
//! ```

pub mod logging;
