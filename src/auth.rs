//! Pre-upgrade authentication seam.
//!
//! Real token validation (session stores, JWT verification, revocation
//! lists) lives outside this crate's scope. The admission pipeline calls a
//! single injected `AuthValidator` so a real implementation can be swapped
//! in without touching the shard; the bundled implementation only proves
//! the seam works end to end.

use async_trait::async_trait;

/// Identity of a successfully authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
}

#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, token: Option<&str>) -> Result<Principal, ()>;
}

/// Accepts any non-empty token, and any request at all when `required` is
/// false. Stands in for a real identity provider.
pub struct PermissiveValidator {
    pub required: bool,
}

#[async_trait]
impl AuthValidator for PermissiveValidator {
    async fn validate(&self, token: Option<&str>) -> Result<Principal, ()> {
        match token {
            Some(t) if !t.is_empty() => Ok(Principal {
                subject: t.to_string(),
            }),
            _ if !self.required => Ok(Principal {
                subject: "anonymous".to_string(),
            }),
            _ => Err(()),
        }
    }
}
