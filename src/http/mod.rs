//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, timeout and trace layers)
//!     → middleware chain (e.g. backend header stamping)
//!     → server.rs forwarder (hyper client to upstream)
//!     → Send to client
//! ```

pub mod middleware;
pub mod server;

pub use server::HttpServer;
