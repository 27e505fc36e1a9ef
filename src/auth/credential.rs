//! Relay Credentials
//!
//! The relay authenticates every connect and reconnect request with a bearer
//! token. Tokens are produced on demand by a [`CredentialProvider`]; how they
//! are obtained or refreshed is up to the provider.

use async_trait::async_trait;
use std::fmt;
use tracing::debug;

use crate::error::RelayError;

/// Source of bearer tokens for relay requests
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Produce a token for the next relay request
    async fn access_token(&self) -> Result<String, RelayError>;
}

/// A fixed token
#[derive(Clone)]
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredential").field("token", &"<redacted>").finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn access_token(&self) -> Result<String, RelayError> {
        Ok(self.token.clone())
    }
}

/// Reads the token from an environment variable on every request, so an
/// external process can rotate it without restarting the tunnel.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

#[async_trait]
impl CredentialProvider for EnvCredential {
    async fn access_token(&self) -> Result<String, RelayError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => {
                debug!(var = %self.var, "Loaded access token from environment");
                Ok(token.trim().to_string())
            }
            Ok(_) => Err(RelayError::Credential(format!("{} is empty", self.var))),
            Err(_) => Err(RelayError::Credential(format!("{} is not set", self.var))),
        }
    }
}
