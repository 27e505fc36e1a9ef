//! Security Module
//!
//! Admission control for local clients.

pub mod policy;

pub use policy::ConnectionPolicy;
