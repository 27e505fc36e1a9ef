//! Authentication Module
//!
//! Bearer-token sources for relay requests.

pub mod credential;

pub use credential::{CredentialProvider, EnvCredential, StaticCredential};
