//! Client library for the FleetRun control plane.
//!
//! Wraps the REST API served under `/v1` with typed methods.

pub mod error;
pub mod http;

pub use error::ClientError;
pub use http::HttpClient;
