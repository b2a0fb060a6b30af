//! API Module
//!
//! REST surface of one host: local subsystems, the host dispatch endpoint and,
//! on the leader, the system and pool operations.

pub mod rest;
pub mod server;

pub use rest::{ApiErrorResponse, RestRouter};
pub use server::{ApiServer, ApiServerConfig};
