//! Negotiators shipped with the crate

use crate::transport::traits::{Credentials, Negotiator};
use anyhow::Result;
use async_trait::async_trait;
use pulse_shared::Identity;

/// Hands out the same credentials on every call.
///
/// Suitable for deployments where the token is provisioned out of band.
#[derive(Debug, Clone)]
pub struct StaticNegotiator {
    credentials: Credentials,
}

impl StaticNegotiator {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Negotiator for StaticNegotiator {
    async fn negotiate(&self, _identity: &Identity) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}
