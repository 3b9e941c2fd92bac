//! Cloud adapters for the CDN broker
//!
//! Two typed facades the route manager depends on:
//! - [`CdnProvider`] over CloudFront distributions
//! - [`CertificateProvider`] over ACM certificates
//!
//! Enable the `mocks` feature to get `MockCdnProvider` and
//! `MockCertificateProvider` for tests.

pub mod acm;
pub mod cdn;
pub mod certs;
pub mod cloudfront;

pub use acm::AcmProvider;
pub use cdn::{
    CdnError, CdnProvider, CreateDistribution, Distribution, DistributionSettings,
    DistributionUpdate, ALIAS_CONFLICT_CODE,
};
pub use certs::{
    certificate_request, idempotency_token, CertError, CertificateDetail, CertificateProvider,
    CertificateRequest, DomainValidationChallenge, IssuanceStatus, MANAGED_BY_TAG,
    SERVICE_INSTANCE_TAG,
};
pub use cloudfront::CloudFrontProvider;

#[cfg(feature = "mocks")]
pub use cdn::MockCdnProvider;
#[cfg(feature = "mocks")]
pub use certs::MockCertificateProvider;

use std::time::Duration;

use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use tracing::info;

/// Bound on every control-plane call to the cloud provider
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Load shared AWS configuration for `region` with the operation timeout applied
pub async fn load_aws_config(region: Option<String>) -> aws_config::SdkConfig {
    let timeouts = TimeoutConfig::builder()
        .operation_timeout(OPERATION_TIMEOUT)
        .build();

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(timeouts);
    if let Some(region) = region {
        loader = loader.region(Region::new(region));
    }

    let config = loader.load().await;
    info!(region = ?config.region(), "AWS configuration loaded");

    config
}
