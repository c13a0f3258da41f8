//! Host networking subsystem.
//!
//! # Data Flow
//! ```text
//! OS interface table
//!     → local_ip.rs (filter loopback and IPv6, pick first)
//!     → String handed to the backend header middleware
//! ```

pub mod local_ip;

pub use local_ip::{AddressResolver, InterfaceResolver, StaticResolver};
