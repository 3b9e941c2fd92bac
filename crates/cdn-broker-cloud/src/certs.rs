//! Certificate adapter contract

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag carrying the owning service instance id
pub const SERVICE_INSTANCE_TAG: &str = "ServiceInstance";

/// Tag identifying certificates requested by this broker
pub const MANAGED_BY_TAG: &str = "ManagedBy";

/// Certificate adapter errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate not found: {0}")]
    NotFound(String),

    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    #[error("certificate request failed: {0}")]
    Provider(String),
}

impl CertError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CertError::NotFound(_))
    }
}

/// Provider issuance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssuanceStatus {
    Issued,
    PendingValidation,
    ValidationTimedOut,
    Failed,
    Inactive,
    Expired,
    Revoked,
    Unknown,
}

impl IssuanceStatus {
    /// Map a provider status string (`ISSUED`, `PENDING_VALIDATION`, ...)
    pub fn from_provider(status: &str) -> Self {
        match status {
            "ISSUED" => IssuanceStatus::Issued,
            "PENDING_VALIDATION" => IssuanceStatus::PendingValidation,
            "VALIDATION_TIMED_OUT" => IssuanceStatus::ValidationTimedOut,
            "FAILED" => IssuanceStatus::Failed,
            "INACTIVE" => IssuanceStatus::Inactive,
            "EXPIRED" => IssuanceStatus::Expired,
            "REVOKED" => IssuanceStatus::Revoked,
            _ => IssuanceStatus::Unknown,
        }
    }

    /// Statuses from which the certificate will never issue
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            IssuanceStatus::Failed
                | IssuanceStatus::Inactive
                | IssuanceStatus::Expired
                | IssuanceStatus::Revoked
        )
    }
}

impl fmt::Display for IssuanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssuanceStatus::Issued => "ISSUED",
            IssuanceStatus::PendingValidation => "PENDING_VALIDATION",
            IssuanceStatus::ValidationTimedOut => "VALIDATION_TIMED_OUT",
            IssuanceStatus::Failed => "FAILED",
            IssuanceStatus::Inactive => "INACTIVE",
            IssuanceStatus::Expired => "EXPIRED",
            IssuanceStatus::Revoked => "REVOKED",
            IssuanceStatus::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Certificate as described by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetail {
    pub arn: String,
    pub domain_name: String,
    pub status: IssuanceStatus,
    pub failure_reason: Option<String>,
    /// Resources (distributions, load balancers) currently using the certificate
    pub in_use_by: Vec<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

impl CertificateDetail {
    pub fn is_tagged_by(&self, broker_tag: &str) -> bool {
        self.tags.get(MANAGED_BY_TAG).map(String::as_str) == Some(broker_tag)
    }
}

/// DNS record a tenant must publish to prove control of a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainValidationChallenge {
    pub domain: String,
    pub record_name: String,
    /// Always `CNAME` for DNS validation
    pub record_type: String,
    pub record_value: String,
    pub validation_status: String,
}

/// A fully composed certificate request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Common name, the first requested domain
    pub domain_name: String,
    /// Remaining domains, `None` for single-domain certificates
    pub subject_alternative_names: Option<Vec<String>>,
    pub idempotency_token: String,
    pub tags: BTreeMap<String, String>,
}

/// Compose a request for `domains` owned by `instance_id`
pub fn certificate_request(
    domains: &[String],
    instance_id: &str,
    broker_tag: &str,
) -> Result<CertificateRequest, CertError> {
    let (common_name, alternatives) = domains
        .split_first()
        .ok_or_else(|| CertError::InvalidRequest("at least one domain is required".to_string()))?;

    let mut tags = BTreeMap::new();
    tags.insert(SERVICE_INSTANCE_TAG.to_string(), instance_id.to_string());
    tags.insert(MANAGED_BY_TAG.to_string(), broker_tag.to_string());

    Ok(CertificateRequest {
        domain_name: common_name.clone(),
        subject_alternative_names: if alternatives.is_empty() {
            None
        } else {
            Some(alternatives.to_vec())
        },
        idempotency_token: idempotency_token(domains),
        tags,
    })
}

/// Sorted join of the domains, so requests for the same set coalesce
pub fn idempotency_token(domains: &[String]) -> String {
    let mut sorted: Vec<&str> = domains.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join("-")
}

/// Typed facade over a managed certificate service
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Request a DNS-validated certificate; returns its ARN
    async fn request_certificate(
        &self,
        domains: &[String],
        instance_id: &str,
    ) -> Result<String, CertError>;

    async fn describe_certificate(&self, arn: &str) -> Result<CertificateDetail, CertError>;

    async fn get_domain_validation_challenges(
        &self,
        arn: &str,
    ) -> Result<Vec<DomainValidationChallenge>, CertError>;

    /// Every certificate in the account, with tags and usage
    async fn list_certificates(&self) -> Result<Vec<CertificateDetail>, CertError>;

    async fn delete_certificate(&self, arn: &str) -> Result<(), CertError>;

    /// Cheap authenticated call used by health checks
    async fn ping(&self) -> Result<(), CertError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_domain_request() {
        let request =
            certificate_request(&domains(&["a.example.com"]), "inst-1", "cdn-broker").unwrap();

        assert_eq!(request.domain_name, "a.example.com");
        assert_eq!(request.subject_alternative_names, None);
        assert_eq!(request.idempotency_token, "a.example.com");
        assert_eq!(request.tags.get(SERVICE_INSTANCE_TAG).unwrap(), "inst-1");
        assert_eq!(request.tags.get(MANAGED_BY_TAG).unwrap(), "cdn-broker");
    }

    #[test]
    fn test_first_domain_is_common_name() {
        let request = certificate_request(
            &domains(&["www.example.com", "example.com", "api.example.com"]),
            "inst-1",
            "cdn-broker",
        )
        .unwrap();

        assert_eq!(request.domain_name, "www.example.com");
        assert_eq!(
            request.subject_alternative_names,
            Some(domains(&["example.com", "api.example.com"]))
        );
    }

    #[test]
    fn test_token_is_stable_under_permutation() {
        let expected = "a.example.com-b.example.com-c.example.com";
        for order in [
            ["a.example.com", "b.example.com", "c.example.com"],
            ["c.example.com", "a.example.com", "b.example.com"],
            ["b.example.com", "c.example.com", "a.example.com"],
        ] {
            assert_eq!(idempotency_token(&domains(&order)), expected);
        }
    }

    #[test]
    fn test_empty_domain_list_is_rejected() {
        let result = certificate_request(&[], "inst-1", "cdn-broker");
        assert!(matches!(result, Err(CertError::InvalidRequest(_))));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(IssuanceStatus::from_provider("ISSUED"), IssuanceStatus::Issued);
        assert_eq!(
            IssuanceStatus::from_provider("VALIDATION_TIMED_OUT"),
            IssuanceStatus::ValidationTimedOut
        );
        assert_eq!(IssuanceStatus::from_provider("bogus"), IssuanceStatus::Unknown);

        assert!(IssuanceStatus::Revoked.is_terminal_failure());
        assert!(!IssuanceStatus::ValidationTimedOut.is_terminal_failure());
        assert!(!IssuanceStatus::PendingValidation.is_terminal_failure());
    }
}
