//! CDN adapter contract
//!
//! The route manager only talks to a CDN through [`CdnProvider`]. Every call
//! may take minutes to propagate on the provider side; callers poll
//! [`CdnProvider::get`] until the distribution reports `Deployed`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// Provider error code for aliases already bound to another distribution
pub const ALIAS_CONFLICT_CODE: &str = "CNAMEAlreadyExists";

/// Status string of a fully propagated distribution
pub const DEPLOYED_STATUS: &str = "Deployed";

/// CDN adapter errors
#[derive(Debug, Error)]
pub enum CdnError {
    /// One of the aliases is claimed by a distribution we do not own
    #[error("CNAMEAlreadyExists: {0}")]
    AliasConflict(String),

    #[error("distribution not found: {0}")]
    NotFound(String),

    #[error("invalid distribution config: {0}")]
    InvalidConfig(String),

    #[error("CDN request failed: {0}")]
    Provider(String),
}

impl CdnError {
    /// True for the typed conflict and for provider errors leaking the code
    pub fn is_alias_conflict(&self) -> bool {
        match self {
            CdnError::AliasConflict(_) => true,
            other => other.to_string().contains(ALIAS_CONFLICT_CODE),
        }
    }
}

/// Cache and origin settings the broker controls on a distribution
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DistributionSettings {
    pub caller_reference: String,
    pub aliases: Vec<String>,
    pub origin: String,
    pub default_ttl: i64,
    pub forwarded_headers: Vec<String>,
    pub forward_cookies: bool,
    /// Certificate bound to the aliases, if any
    pub certificate_arn: Option<String>,
}

impl DistributionSettings {
    /// Overwrite only the fields the update carries
    pub fn apply(&mut self, update: &DistributionUpdate) {
        if let Some(ref aliases) = update.aliases {
            self.aliases = aliases.clone();
        }
        self.origin = update.origin.clone();
        if let Some(default_ttl) = update.default_ttl {
            self.default_ttl = default_ttl;
        }
        if let Some(ref headers) = update.forwarded_headers {
            self.forwarded_headers = headers.clone();
        }
        if let Some(forward_cookies) = update.forward_cookies {
            self.forward_cookies = forward_cookies;
        }
    }
}

/// A distribution as last reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub id: String,
    /// Provider-assigned hostname tenants CNAME to
    pub domain_name: String,
    /// `InProgress` or `Deployed`
    pub status: String,
    pub enabled: bool,
    pub settings: DistributionSettings,
}

impl Distribution {
    pub fn is_deployed(&self) -> bool {
        self.status == DEPLOYED_STATUS
    }
}

/// Parameters for creating a distribution
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateDistribution {
    /// Unique per distribution; the service instance id
    pub caller_reference: String,
    /// Empty on create, aliases follow the certificate
    pub aliases: Vec<String>,
    pub origin: String,
    pub default_ttl: i64,
    pub forwarded_headers: Vec<String>,
    pub forward_cookies: bool,
    pub tags: BTreeMap<String, String>,
}

impl CreateDistribution {
    pub fn settings(&self) -> DistributionSettings {
        DistributionSettings {
            caller_reference: self.caller_reference.clone(),
            aliases: self.aliases.clone(),
            origin: self.origin.clone(),
            default_ttl: self.default_ttl,
            forwarded_headers: self.forwarded_headers.clone(),
            forward_cookies: self.forward_cookies,
            certificate_arn: None,
        }
    }
}

/// Partial update of a distribution; `None` keeps the current value
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DistributionUpdate {
    pub aliases: Option<Vec<String>>,
    pub origin: String,
    pub default_ttl: Option<i64>,
    pub forwarded_headers: Option<Vec<String>>,
    pub forward_cookies: Option<bool>,
}

/// Typed facade over a CDN provider
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait CdnProvider: Send + Sync {
    /// Create a distribution; the only non-idempotent call
    async fn create(&self, request: &CreateDistribution) -> Result<Distribution, CdnError>;

    async fn get(&self, id: &str) -> Result<Distribution, CdnError>;

    /// Read-modify-write of the distribution config
    async fn update(
        &self,
        id: &str,
        update: &DistributionUpdate,
    ) -> Result<Distribution, CdnError>;

    /// Bind a certificate and the aliases it covers in one write
    async fn set_certificate_and_aliases(
        &self,
        id: &str,
        certificate_arn: &str,
        aliases: &[String],
    ) -> Result<(), CdnError>;

    /// Flip the distribution to disabled, a prerequisite for delete
    async fn disable(&self, id: &str) -> Result<(), CdnError>;

    /// Delete a disabled distribution.
    ///
    /// Returns `Ok(false)` while the disable is still propagating.
    async fn delete(&self, id: &str) -> Result<bool, CdnError>;

    /// Cheap authenticated call used by health checks
    async fn ping(&self) -> Result<(), CdnError>;
}
