//! API Middleware
//!
//! Broker endpoints are protected by HTTP Basic authentication; health
//! checks stay public.

pub mod auth;

pub use auth::{require_basic_auth, BasicCredentials};
