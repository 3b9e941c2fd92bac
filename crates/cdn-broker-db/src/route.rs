//! The `Route` aggregate and the certificates it owns
//!
//! A route is loaded and saved as a unit: the store always reads the owned
//! certificates alongside the row and writes them back in the same
//! transaction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{certificate, route};
use crate::{CertificateStatus, RouteState};

/// Hard ceiling on how long a route may sit in `Provisioning`.
///
/// The certificate service gives up on DNS validation after 72 hours; the
/// remainder is slack for the hourly sweep.
pub const PROVISIONING_TIMEOUT_HOURS: i64 = 84;

/// An issuance attempt owned by a route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    /// Row id, `None` until the owning route is saved
    pub id: Option<i32>,
    /// Empty for legacy rows that predate managed certificates
    pub certificate_arn: String,
    pub status: CertificateStatus,
    pub cert_url: Option<String>,
    pub certificate: Option<Vec<u8>>,
    pub expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Certificate {
    /// A freshly requested certificate waiting for DNS validation
    pub fn validating(certificate_arn: impl Into<String>) -> Self {
        Self {
            id: None,
            certificate_arn: certificate_arn.into(),
            status: CertificateStatus::Validating,
            cert_url: None,
            certificate: None,
            expires: None,
            created_at: Utc::now(),
        }
    }

    pub fn arn(&self) -> Option<&str> {
        if self.certificate_arn.is_empty() {
            None
        } else {
            Some(&self.certificate_arn)
        }
    }

    pub(crate) fn from_model(model: certificate::Model) -> Self {
        Self {
            id: Some(model.id),
            certificate_arn: model.certificate_arn.unwrap_or_default(),
            status: model.certificate_status,
            cert_url: model.cert_url,
            certificate: model.certificate,
            expires: model.expires,
            created_at: model.created_at,
        }
    }
}

/// One tenant's CDN instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Row id, `None` until created
    pub id: Option<i32>,
    pub instance_id: String,
    pub state: RouteState,
    /// Comma joined domains; order is preserved, the first is the common name
    pub domain_external: String,
    pub domain_internal: String,
    pub dist_id: String,
    pub origin: String,
    pub default_ttl: i64,
    pub forwarded_headers: Vec<String>,
    pub forward_cookies: bool,
    pub provisioning_since: Option<DateTime<Utc>>,
    pub certificates: Vec<Certificate>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Version the route was loaded at
    pub lock_version: i32,
}

impl Route {
    /// Compose a new route in `Provisioning` with no certificates
    pub fn new(
        instance_id: impl Into<String>,
        domains: &[String],
        origin: impl Into<String>,
        default_ttl: i64,
        forwarded_headers: Vec<String>,
        forward_cookies: bool,
    ) -> Self {
        Self {
            id: None,
            instance_id: instance_id.into(),
            state: RouteState::Provisioning,
            domain_external: join_domains(domains),
            domain_internal: String::new(),
            dist_id: String::new(),
            origin: origin.into(),
            default_ttl,
            forwarded_headers,
            forward_cookies,
            provisioning_since: None,
            certificates: Vec::new(),
            created_at: None,
            updated_at: None,
            lock_version: 0,
        }
    }

    /// Domains in user-supplied order, duplicates removed
    pub fn domains(&self) -> Vec<String> {
        split_domains(&self.domain_external)
    }

    pub fn set_domains(&mut self, domains: &[String]) {
        self.domain_external = join_domains(domains);
    }

    /// True once a provisioning route has outlived the validation window
    pub fn is_provisioning_expired(&self, now: DateTime<Utc>) -> bool {
        if self.state != RouteState::Provisioning {
            return false;
        }
        match self.provisioning_since {
            Some(since) => since < now - Duration::hours(PROVISIONING_TIMEOUT_HOURS),
            None => false,
        }
    }

    /// Indices of the most recent validating certificate and the attached one.
    ///
    /// The newest validating certificate wins by `created_at`; on a tie the
    /// later entry in the sequence wins.
    pub fn find_validating_and_attached(&self) -> (Option<usize>, Option<usize>) {
        let mut validating: Option<usize> = None;
        let mut attached: Option<usize> = None;

        for (idx, cert) in self.certificates.iter().enumerate() {
            match cert.status {
                CertificateStatus::Validating => {
                    let newer = match validating {
                        Some(current) => {
                            cert.created_at >= self.certificates[current].created_at
                        }
                        None => true,
                    };
                    if newer {
                        validating = Some(idx);
                    }
                }
                CertificateStatus::Attached => attached = Some(idx),
                CertificateStatus::Deleted | CertificateStatus::Failed => {}
            }
        }

        (validating, attached)
    }

    pub fn attached_certificate(&self) -> Option<&Certificate> {
        self.certificates
            .iter()
            .find(|cert| cert.status == CertificateStatus::Attached)
    }

    pub(crate) fn from_models(model: route::Model, certificates: Vec<certificate::Model>) -> Self {
        Self {
            id: Some(model.id),
            instance_id: model.instance_id,
            state: model.state,
            domain_external: model.domain_external,
            domain_internal: model.domain_internal,
            dist_id: model.dist_id,
            origin: model.origin,
            default_ttl: model.default_ttl,
            forwarded_headers: split_list(&model.forwarded_headers),
            forward_cookies: model.forward_cookies,
            provisioning_since: model.provisioning_since,
            certificates: certificates.into_iter().map(Certificate::from_model).collect(),
            created_at: Some(model.created_at),
            updated_at: Some(model.updated_at),
            lock_version: model.lock_version,
        }
    }
}

/// Serialize an ordered domain set the way it is stored
pub fn join_domains(domains: &[String]) -> String {
    let mut seen: Vec<&str> = Vec::with_capacity(domains.len());
    for domain in domains {
        let domain = domain.trim();
        if !domain.is_empty() && !seen.contains(&domain) {
            seen.push(domain);
        }
    }
    seen.join(",")
}

/// Parse a stored or user-supplied domain list
pub fn split_domains(csv: &str) -> Vec<String> {
    let mut domains: Vec<String> = Vec::new();
    for domain in split_list(csv) {
        if !domains.contains(&domain) {
            domains.push(domain);
        }
    }
    domains
}

pub(crate) fn split_list(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `provisioning_since` after a write moving the route from `previous` to `next`.
///
/// Entering an actively-changing state stamps `now`, leaving one clears it.
/// Staying inside keeps the original stamp. That includes moving between
/// the two actively-changing states: a route deprovisioned while still
/// `Provisioning` carries its provisioning stamp into `Deprovisioning`.
/// Only `Provisioning` is subject to the expiry check, so the inherited
/// stamp never times out a deprovision.
pub(crate) fn provisioning_since_after(
    previous: Option<RouteState>,
    next: RouteState,
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !next.is_actively_changing() {
        return None;
    }
    match previous {
        Some(prev) if prev.is_actively_changing() => current.or(Some(now)),
        _ => Some(now),
    }
}
