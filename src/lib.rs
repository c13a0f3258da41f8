//! Backend identification header middleware for an HTTP reverse proxy.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use http::middleware::{BackendHeader, MiddlewareRegistry};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
