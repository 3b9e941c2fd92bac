use cdn_broker_cloud::{CdnError, CertError, IssuanceStatus, ALIAS_CONFLICT_CODE};
use cdn_broker_db::StoreError;
use thiserror::Error;

/// Errors the route manager distinguishes
#[derive(Debug, Error)]
pub enum RouteManagerError {
    #[error("instance {0} does not exist")]
    InstanceDoesNotExist(String),

    #[error("instance {0} already exists")]
    InstanceAlreadyExists(String),

    #[error("domain {domain} is already in use by instance {instance_id}")]
    DomainAlreadyClaimed { domain: String, instance_id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Creating the distribution failed; nothing was persisted
    #[error("failed to provision distribution: {0}")]
    ProvisionFailed(#[source] CdnError),

    #[error("failed to request certificate: {0}")]
    CertificateRequestFailed(#[source] CertError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// The provider gave up on DNS validation
    #[error("certificate validation timed out")]
    ValidationTimedOut,

    /// Aliases are bound to a distribution we do not own
    #[error("{0}")]
    AliasConflict(#[source] CdnError),

    #[error("certificate {arn} is {status}: {reason}")]
    CertificateTerminalFailure {
        arn: String,
        status: IssuanceStatus,
        reason: String,
    },

    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("CDN error: {0}")]
    Cdn(#[from] CdnError),

    #[error("certificate service error: {0}")]
    Certificate(#[from] CertError),
}

impl RouteManagerError {
    /// Typed conflict, or any error whose text carries the provider's code
    pub fn is_alias_conflict(&self) -> bool {
        match self {
            RouteManagerError::AliasConflict(_) => true,
            RouteManagerError::Cdn(err) => err.is_alias_conflict(),
            other => other.to_string().contains(ALIAS_CONFLICT_CODE),
        }
    }

    pub fn is_validation_timed_out(&self) -> bool {
        matches!(self, RouteManagerError::ValidationTimedOut)
    }
}
