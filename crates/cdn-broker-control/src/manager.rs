//! Route manager: the provisioning control loop
//!
//! Inline callers (the broker API) create, update and disable routes. The
//! reconciliation sweep polls every route in an actively-changing state and
//! advances it one step at a time. Every step is safe to replay: the only
//! non-idempotent side effect is the initial distribution create.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use cdn_broker_cloud::{
    CdnError, CdnProvider, CertificateDetail, CertificateProvider, CreateDistribution,
    Distribution, DistributionUpdate, DomainValidationChallenge, IssuanceStatus,
};
use cdn_broker_db::route::split_domains;
use cdn_broker_db::{
    Certificate, CertificateStatus, Route, RouteFilter, RouteState, RouteStore, StoreError,
};

use crate::RouteManagerError;

/// Managed certificates younger than this are never treated as orphans
pub const DEFAULT_ORPHAN_MIN_AGE_HOURS: i64 = 24;

/// Route manager configuration, injected at construction
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Value of the tag marking certificates this broker requested
    pub broker_tag: String,
    /// Minimum age of an issued, unused certificate before it is deleted
    pub orphan_min_age: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            broker_tag: "cdn-broker".to_string(),
            orphan_min_age: Duration::hours(DEFAULT_ORPHAN_MIN_AGE_HOURS),
        }
    }
}

/// Everything needed to create a route
#[derive(Debug, Clone, Default)]
pub struct CreateRoute {
    pub instance_id: String,
    /// Ordered domains; the first becomes the certificate common name
    pub domains: Vec<String>,
    pub origin: String,
    pub default_ttl: i64,
    pub forwarded_headers: Vec<String>,
    pub forward_cookies: bool,
    pub tags: BTreeMap<String, String>,
}

/// Partial update; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct UpdateRoute {
    pub domains: Option<Vec<String>>,
    pub origin: Option<String>,
    pub default_ttl: Option<i64>,
    pub forwarded_headers: Option<Vec<String>>,
    pub forward_cookies: Option<bool>,
}

/// Outcome counts of one reconciliation sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub polled: usize,
    pub conflict: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub errors: usize,
}

/// Outcome counts of one orphan sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub examined: usize,
    pub deleted: usize,
    pub errors: usize,
}

pub struct RouteManager {
    store: RouteStore,
    cdn: Arc<dyn CdnProvider>,
    certs: Arc<dyn CertificateProvider>,
    config: ManagerConfig,
}

impl RouteManager {
    pub fn new(
        store: RouteStore,
        cdn: Arc<dyn CdnProvider>,
        certs: Arc<dyn CertificateProvider>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            cdn,
            certs,
            config,
        }
    }

    pub fn store(&self) -> &RouteStore {
        &self.store
    }

    pub fn cdn(&self) -> &Arc<dyn CdnProvider> {
        &self.cdn
    }

    pub fn certs(&self) -> &Arc<dyn CertificateProvider> {
        &self.certs
    }

    /// Create the distribution, request a certificate and persist the route.
    ///
    /// A persistence failure after the cloud calls leaks the distribution and
    /// certificate; the orphan sweep reclaims the certificate.
    pub async fn create(&self, request: CreateRoute) -> Result<Route, RouteManagerError> {
        let mut route = Route::new(
            request.instance_id.as_str(),
            &request.domains,
            request.origin.as_str(),
            request.default_ttl,
            request.forwarded_headers,
            request.forward_cookies,
        );
        let domains = route.domains();
        if domains.is_empty() {
            return Err(RouteManagerError::InvalidRequest(
                "at least one domain is required".to_string(),
            ));
        }

        match self
            .store
            .find_one_matching(&RouteFilter::instance(route.instance_id.as_str()))
            .await
        {
            Ok(_) => {
                return Err(RouteManagerError::InstanceAlreadyExists(
                    route.instance_id.clone(),
                ))
            }
            Err(StoreError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        self.ensure_domains_available(&route.instance_id, &domains)
            .await?;

        let distribution = self
            .cdn
            .create(&CreateDistribution {
                caller_reference: route.instance_id.clone(),
                aliases: Vec::new(),
                origin: route.origin.clone(),
                default_ttl: route.default_ttl,
                forwarded_headers: route.forwarded_headers.clone(),
                forward_cookies: route.forward_cookies,
                tags: request.tags,
            })
            .await
            .map_err(RouteManagerError::ProvisionFailed)?;

        route.domain_internal = distribution.domain_name;
        route.dist_id = distribution.id;

        let arn = self
            .certs
            .request_certificate(&domains, &route.instance_id)
            .await
            .map_err(RouteManagerError::CertificateRequestFailed)?;
        route.certificates.push(Certificate::validating(arn));

        if let Err(err) = self.store.create(&mut route).await {
            error!(
                instance_id = %route.instance_id,
                dist_id = %route.dist_id,
                error = %err,
                "Failed to persist route, cloud resources are left for the orphan sweep"
            );
            return Err(err.into());
        }

        info!(
            instance_id = %route.instance_id,
            dist_id = %route.dist_id,
            domains = %route.domain_external,
            "Route created"
        );

        Ok(route)
    }

    /// Apply cache changes and optionally start a domain swap.
    ///
    /// Returns `true` when the update continues asynchronously (a new
    /// certificate must validate before the aliases change).
    pub async fn update(
        &self,
        instance_id: &str,
        request: UpdateRoute,
    ) -> Result<bool, RouteManagerError> {
        let mut route = self.get(instance_id).await?;

        if let Some(origin) = request.origin {
            route.origin = origin;
        }
        if let Some(default_ttl) = request.default_ttl {
            route.default_ttl = default_ttl;
        }
        if let Some(headers) = request.forwarded_headers {
            route.forwarded_headers = headers;
        }
        if let Some(forward_cookies) = request.forward_cookies {
            route.forward_cookies = forward_cookies;
        }

        let domains = request
            .domains
            .map(|domains| split_domains(&domains.join(",")))
            .filter(|domains| !domains.is_empty());
        if let Some(ref domains) = domains {
            self.ensure_domains_available(instance_id, domains).await?;
        }

        // Aliases only move once the new certificate is attached
        self.cdn
            .update(
                &route.dist_id,
                &DistributionUpdate {
                    aliases: None,
                    origin: route.origin.clone(),
                    default_ttl: Some(route.default_ttl),
                    forwarded_headers: Some(route.forwarded_headers.clone()),
                    forward_cookies: Some(route.forward_cookies),
                },
            )
            .await?;

        let Some(domains) = domains else {
            // A route still waiting for its first certificate stays with the sweep
            if route.attached_certificate().is_some() {
                route.state = RouteState::Provisioned;
            } else {
                warn!(
                    instance_id = %instance_id,
                    state = ?route.state,
                    "Route has no attached certificate, leaving state unchanged"
                );
            }
            self.store.save(&mut route).await?;
            info!(instance_id = %instance_id, "Route updated");
            return Ok(false);
        };

        route.set_domains(&domains);
        route.state = RouteState::Provisioning;

        let arn = self
            .certs
            .request_certificate(&domains, instance_id)
            .await
            .map_err(RouteManagerError::CertificateRequestFailed)?;
        route.certificates.push(Certificate::validating(arn.as_str()));

        self.store.save(&mut route).await?;
        info!(
            instance_id = %instance_id,
            arn = %arn,
            domains = %route.domain_external,
            "Route update waiting for certificate validation"
        );

        Ok(true)
    }

    /// Load a route by instance id
    pub async fn get(&self, instance_id: &str) -> Result<Route, RouteManagerError> {
        self.store
            .find_one_matching(&RouteFilter::instance(instance_id))
            .await
            .map_err(|err| match err {
                StoreError::NotFound => {
                    RouteManagerError::InstanceDoesNotExist(instance_id.to_string())
                }
                other => other.into(),
            })
    }

    /// Advance a route one step; stable states are a no-op
    pub async fn poll(&self, route: &mut Route) -> Result<(), RouteManagerError> {
        match route.state {
            RouteState::Provisioning => self.advance_provisioning(route).await,
            RouteState::Deprovisioning => self.advance_deprovisioning(route).await,
            _ => Ok(()),
        }
    }

    async fn advance_provisioning(&self, route: &mut Route) -> Result<(), RouteManagerError> {
        let distribution = self.cdn.get(&route.dist_id).await?;
        if !distribution.is_deployed() || !distribution.enabled {
            debug!(
                instance_id = %route.instance_id,
                dist_id = %route.dist_id,
                status = %distribution.status,
                "Distribution not deployed yet"
            );
            return Ok(());
        }

        let (validating, attached) = route.find_validating_and_attached();
        let validating = validating.ok_or_else(|| {
            RouteManagerError::InternalInconsistency(format!(
                "route {} is provisioning without a validating certificate",
                route.instance_id
            ))
        })?;
        let arn = route.certificates[validating].certificate_arn.clone();

        match self.is_certificate_issued(&arn).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(instance_id = %route.instance_id, arn = %arn, "Certificate pending validation");
                return Ok(());
            }
            Err(RouteManagerError::ValidationTimedOut) => {
                // Persisted by the caller together with the route state
                route.certificates[validating].status = CertificateStatus::Failed;
                return Err(RouteManagerError::ValidationTimedOut);
            }
            Err(err) => return Err(err),
        }

        let domains = route.domains();
        self.cdn
            .set_certificate_and_aliases(&route.dist_id, &arn, &domains)
            .await
            .map_err(|err| {
                if err.is_alias_conflict() {
                    RouteManagerError::AliasConflict(err)
                } else {
                    RouteManagerError::Cdn(err)
                }
            })?;

        if let Some(attached) = attached {
            route.certificates[attached].status = CertificateStatus::Deleted;
        }
        route.certificates[validating].status = CertificateStatus::Attached;
        route.state = RouteState::Provisioned;
        self.store.save(route).await?;

        info!(
            instance_id = %route.instance_id,
            dist_id = %route.dist_id,
            arn = %arn,
            "Route provisioned"
        );

        Ok(())
    }

    async fn advance_deprovisioning(&self, route: &mut Route) -> Result<(), RouteManagerError> {
        let deleted = self.cdn.delete(&route.dist_id).await?;
        if !deleted {
            debug!(instance_id = %route.instance_id, dist_id = %route.dist_id, "Distribution still draining");
            return Ok(());
        }

        route.state = RouteState::Deprovisioned;
        self.store.save(route).await?;
        info!(instance_id = %route.instance_id, dist_id = %route.dist_id, "Route deprovisioned");

        Ok(())
    }

    /// Disable the distribution and hand the route to the sweep for deletion
    pub async fn disable(&self, route: &mut Route) -> Result<(), RouteManagerError> {
        self.cdn.disable(&route.dist_id).await?;

        route.state = RouteState::Deprovisioning;
        self.store.save(route).await?;
        info!(instance_id = %route.instance_id, dist_id = %route.dist_id, "Route disabled");

        Ok(())
    }

    /// Poll every route in an actively-changing state
    pub async fn check_routes_to_update(&self) -> Result<SweepReport, RouteManagerError> {
        let routes = self
            .store
            .find_in_states(&RouteState::ACTIVELY_CHANGING)
            .await?;
        let now = Utc::now();
        let mut report = SweepReport::default();

        for mut route in routes {
            report.polled += 1;

            match self.poll(&mut route).await {
                Ok(()) => {}
                Err(err) if err.is_alias_conflict() => {
                    warn!(instance_id = %route.instance_id, error = %err, "Aliases claimed elsewhere");
                    route.state = RouteState::Conflict;
                    self.persist(&mut route, &mut report).await;
                    report.conflict += 1;
                    continue;
                }
                Err(err) if err.is_validation_timed_out() => {
                    warn!(instance_id = %route.instance_id, "Certificate validation timed out");
                    route.state = RouteState::Failed;
                    self.persist(&mut route, &mut report).await;
                    report.failed += 1;
                    continue;
                }
                Err(err) => {
                    error!(
                        instance_id = %route.instance_id,
                        state = ?route.state,
                        error = %err,
                        "Failed to poll route"
                    );
                    report.errors += 1;
                }
            }

            // Disabling is left to the broker's deprovision
            if route.is_provisioning_expired(now) {
                warn!(
                    instance_id = %route.instance_id,
                    since = ?route.provisioning_since,
                    "Provisioning expired"
                );
                route.state = RouteState::TimedOut;
                self.persist(&mut route, &mut report).await;
                report.timed_out += 1;
            }
        }

        info!(
            polled = report.polled,
            conflict = report.conflict,
            failed = report.failed,
            timed_out = report.timed_out,
            errors = report.errors,
            "Route sweep finished"
        );

        Ok(report)
    }

    async fn persist(&self, route: &mut Route, report: &mut SweepReport) {
        if let Err(err) = self.store.save(route).await {
            error!(
                instance_id = %route.instance_id,
                state = %route.state,
                error = %err,
                "Failed to persist route state"
            );
            report.errors += 1;
        }
    }

    /// Delete issued, unused, broker-tagged certificates older than the minimum age
    pub async fn delete_orphaned_certs(&self) -> Result<OrphanReport, RouteManagerError> {
        let certificates = self.certs.list_certificates().await?;
        let cutoff = Utc::now() - self.config.orphan_min_age;
        let mut report = OrphanReport {
            examined: certificates.len(),
            ..Default::default()
        };

        for cert in certificates
            .iter()
            .filter(|cert| is_orphan(cert, &self.config.broker_tag, cutoff))
        {
            match self.certs.delete_certificate(&cert.arn).await {
                Ok(()) => {
                    info!(arn = %cert.arn, domain = %cert.domain_name, "Deleted orphaned certificate");
                    report.deleted += 1;
                }
                Err(err) => {
                    error!(arn = %cert.arn, error = %err, "Failed to delete orphaned certificate");
                    report.errors += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            deleted = report.deleted,
            errors = report.errors,
            "Orphan sweep finished"
        );

        Ok(report)
    }

    /// DNS records the tenant must publish for the route's certificates.
    ///
    /// Certificates the provider no longer knows about are skipped.
    pub async fn get_dns_challenges(
        &self,
        route: &Route,
        only_validating: bool,
    ) -> Result<Vec<DomainValidationChallenge>, RouteManagerError> {
        let (validating, attached) = route.find_validating_and_attached();

        let targets: Vec<usize> = if only_validating {
            let validating = validating.ok_or_else(|| {
                RouteManagerError::InternalInconsistency(format!(
                    "route {} has no validating certificate",
                    route.instance_id
                ))
            })?;
            vec![validating]
        } else {
            validating.into_iter().chain(attached).collect()
        };

        let mut challenges = Vec::new();
        for idx in targets {
            let Some(arn) = route.certificates[idx].arn() else {
                continue;
            };

            match self.certs.get_domain_validation_challenges(arn).await {
                Ok(found) => challenges.extend(found),
                Err(err) if err.is_not_found() => {
                    warn!(instance_id = %route.instance_id, arn = %arn, "Certificate not found, skipping challenges");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(challenges)
    }

    pub async fn get_cdn_configuration(
        &self,
        route: &Route,
    ) -> Result<Distribution, RouteManagerError> {
        self.cdn.get(&route.dist_id).await.map_err(|err| match err {
            CdnError::NotFound(_) => RouteManagerError::InternalInconsistency(format!(
                "distribution {} of route {} not found",
                route.dist_id, route.instance_id
            )),
            other => other.into(),
        })
    }

    /// Whether the certificate has issued; errors for timed out or dead certificates
    pub async fn is_certificate_issued(&self, arn: &str) -> Result<bool, RouteManagerError> {
        let detail = self.certs.describe_certificate(arn).await?;

        match detail.status {
            IssuanceStatus::Issued => Ok(true),
            IssuanceStatus::PendingValidation => Ok(false),
            IssuanceStatus::ValidationTimedOut => Err(RouteManagerError::ValidationTimedOut),
            IssuanceStatus::Failed
            | IssuanceStatus::Inactive
            | IssuanceStatus::Expired
            | IssuanceStatus::Revoked => Err(RouteManagerError::CertificateTerminalFailure {
                arn: arn.to_string(),
                status: detail.status,
                reason: detail.failure_reason.unwrap_or_default(),
            }),
            IssuanceStatus::Unknown => {
                warn!(arn = %arn, "Unknown certificate status, treating as pending");
                Ok(false)
            }
        }
    }

    /// Fail if another live route already serves any of `domains`
    async fn ensure_domains_available(
        &self,
        instance_id: &str,
        domains: &[String],
    ) -> Result<(), RouteManagerError> {
        let claimants = self.store.find_claiming_domains(domains).await?;

        for claimant in claimants
            .iter()
            .filter(|route| route.instance_id != instance_id)
        {
            let claimed = claimant.domains();
            if let Some(domain) = domains.iter().find(|domain| claimed.contains(domain)) {
                return Err(RouteManagerError::DomainAlreadyClaimed {
                    domain: domain.clone(),
                    instance_id: claimant.instance_id.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Issued, unused, tagged by `broker_tag` and issued before `cutoff`
pub fn is_orphan(cert: &CertificateDetail, broker_tag: &str, cutoff: DateTime<Utc>) -> bool {
    cert.status == IssuanceStatus::Issued
        && cert.in_use_by.is_empty()
        && cert.is_tagged_by(broker_tag)
        && cert.issued_at.map(|at| at < cutoff).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdn_broker_cloud::MANAGED_BY_TAG;

    fn cert(status: IssuanceStatus, in_use: bool, tagged: bool, age_hours: i64) -> CertificateDetail {
        let mut tags = BTreeMap::new();
        if tagged {
            tags.insert(MANAGED_BY_TAG.to_string(), "cdn-broker".to_string());
        }
        CertificateDetail {
            arn: "arn".to_string(),
            domain_name: "a.example.com".to_string(),
            status,
            failure_reason: None,
            in_use_by: if in_use {
                vec!["arn:aws:cloudfront::1:distribution/D1".to_string()]
            } else {
                vec![]
            },
            issued_at: Some(Utc::now() - Duration::hours(age_hours)),
            tags,
        }
    }

    #[test]
    fn test_orphan_requires_every_condition() {
        let cutoff = Utc::now() - Duration::hours(24);

        assert!(is_orphan(&cert(IssuanceStatus::Issued, false, true, 48), "cdn-broker", cutoff));
        assert!(!is_orphan(
            &cert(IssuanceStatus::PendingValidation, false, true, 48),
            "cdn-broker",
            cutoff
        ));
        assert!(!is_orphan(&cert(IssuanceStatus::Issued, true, true, 48), "cdn-broker", cutoff));
        assert!(!is_orphan(&cert(IssuanceStatus::Issued, false, true, 2), "cdn-broker", cutoff));
        assert!(!is_orphan(&cert(IssuanceStatus::Issued, false, false, 48), "cdn-broker", cutoff));
        assert!(!is_orphan(&cert(IssuanceStatus::Issued, false, true, 48), "other-broker", cutoff));
    }

    #[test]
    fn test_certificate_without_issue_date_is_kept() {
        let mut detail = cert(IssuanceStatus::Issued, false, true, 48);
        detail.issued_at = None;
        assert!(!is_orphan(&detail, "cdn-broker", Utc::now()));
    }
}
