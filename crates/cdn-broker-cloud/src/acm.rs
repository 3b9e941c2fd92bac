//! ACM implementation of [`CertificateProvider`]

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_acm::error::{BuildError, DisplayErrorContext, SdkError};
use aws_sdk_acm::primitives::DateTime as AwsDateTime;
use aws_sdk_acm::types::{Tag, ValidationMethod};
use aws_sdk_acm::Client;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::certs::{
    certificate_request, CertError, CertificateDetail, CertificateProvider,
    DomainValidationChallenge, IssuanceStatus,
};

/// ACM accepts at most 32 word characters as an idempotency token
const MAX_TOKEN_LEN: usize = 32;

/// ACM-backed certificate adapter
pub struct AcmProvider {
    client: Client,
    broker_tag: String,
}

impl AcmProvider {
    pub fn new(config: &aws_config::SdkConfig, broker_tag: impl Into<String>) -> Self {
        Self::from_client(Client::new(config), broker_tag)
    }

    pub fn from_client(client: Client, broker_tag: impl Into<String>) -> Self {
        Self {
            client,
            broker_tag: broker_tag.into(),
        }
    }

    async fn tags(&self, arn: &str) -> Result<BTreeMap<String, String>, CertError> {
        let output = self
            .client
            .list_tags_for_certificate()
            .certificate_arn(arn)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false)
                {
                    CertError::NotFound(arn.to_string())
                } else {
                    provider_error(err)
                }
            })?;

        Ok(output
            .tags()
            .iter()
            .map(|tag| {
                (
                    tag.key().to_string(),
                    tag.value().unwrap_or_default().to_string(),
                )
            })
            .collect())
    }

    async fn describe(
        &self,
        arn: &str,
    ) -> Result<aws_sdk_acm::types::CertificateDetail, CertError> {
        let output = self
            .client
            .describe_certificate()
            .certificate_arn(arn)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false)
                {
                    CertError::NotFound(arn.to_string())
                } else {
                    provider_error(err)
                }
            })?;

        output
            .certificate()
            .cloned()
            .ok_or_else(|| CertError::NotFound(arn.to_string()))
    }
}

#[async_trait]
impl CertificateProvider for AcmProvider {
    async fn request_certificate(
        &self,
        domains: &[String],
        instance_id: &str,
    ) -> Result<String, CertError> {
        let request = certificate_request(domains, instance_id, &self.broker_tag)?;

        let tags = request
            .tags
            .iter()
            .map(|(key, value)| {
                Tag::builder()
                    .key(key)
                    .value(value)
                    .build()
                    .map_err(build_error)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .request_certificate()
            .domain_name(&request.domain_name)
            .set_subject_alternative_names(request.subject_alternative_names.clone())
            .validation_method(ValidationMethod::Dns)
            .idempotency_token(provider_token(&request.idempotency_token))
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(provider_error)?;

        let arn = output
            .certificate_arn()
            .ok_or_else(|| CertError::Provider("request returned no certificate ARN".to_string()))?
            .to_string();

        info!(
            instance_id = %instance_id,
            arn = %arn,
            domain = %request.domain_name,
            "certificate requested"
        );

        Ok(arn)
    }

    async fn describe_certificate(&self, arn: &str) -> Result<CertificateDetail, CertError> {
        let detail = self.describe(arn).await?;

        Ok(CertificateDetail {
            arn: detail.certificate_arn().unwrap_or(arn).to_string(),
            domain_name: detail.domain_name().unwrap_or_default().to_string(),
            status: detail
                .status()
                .map(|status| IssuanceStatus::from_provider(status.as_str()))
                .unwrap_or(IssuanceStatus::Unknown),
            failure_reason: detail.failure_reason().map(|r| r.as_str().to_string()),
            in_use_by: detail.in_use_by().to_vec(),
            issued_at: detail.issued_at().and_then(to_chrono),
            tags: BTreeMap::new(),
        })
    }

    async fn get_domain_validation_challenges(
        &self,
        arn: &str,
    ) -> Result<Vec<DomainValidationChallenge>, CertError> {
        let detail = self.describe(arn).await?;

        // Records appear a few seconds after the request; skip options without one
        Ok(detail
            .domain_validation_options()
            .iter()
            .filter_map(|option| {
                let record = option.resource_record()?;
                Some(DomainValidationChallenge {
                    domain: option.domain_name().to_string(),
                    record_name: record.name().to_string(),
                    record_type: record.r#type().as_str().to_string(),
                    record_value: record.value().to_string(),
                    validation_status: option
                        .validation_status()
                        .map(|status| status.as_str().to_string())
                        .unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn list_certificates(&self) -> Result<Vec<CertificateDetail>, CertError> {
        let mut arns = Vec::new();
        let mut paginator = self.client.list_certificates().into_paginator().send();

        while let Some(page) = paginator.next().await {
            let page = page.map_err(provider_error)?;
            arns.extend(
                page.certificate_summary_list()
                    .iter()
                    .filter_map(|summary| summary.certificate_arn())
                    .map(str::to_string),
            );
        }

        debug!(count = arns.len(), "listing certificate details");

        let mut certificates = Vec::with_capacity(arns.len());
        for arn in arns {
            let mut detail = match self.describe_certificate(&arn).await {
                Ok(detail) => detail,
                // Deleted between list and describe
                Err(CertError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            detail.tags = match self.tags(&arn).await {
                Ok(tags) => tags,
                Err(CertError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            certificates.push(detail);
        }

        Ok(certificates)
    }

    async fn delete_certificate(&self, arn: &str) -> Result<(), CertError> {
        self.client
            .delete_certificate()
            .certificate_arn(arn)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false)
                {
                    CertError::NotFound(arn.to_string())
                } else {
                    provider_error(err)
                }
            })?;

        info!(arn = %arn, "certificate deleted");
        Ok(())
    }

    async fn ping(&self) -> Result<(), CertError> {
        self.client
            .list_certificates()
            .max_items(1)
            .send()
            .await
            .map_err(provider_error)?;
        Ok(())
    }
}

/// Fit the domain token into ACM's `\w{1,32}` constraint.
///
/// The token is hashed rather than sanitized so distinct domain sets never
/// collapse onto the same token.
fn provider_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(MAX_TOKEN_LEN);
    digest
}

fn to_chrono(value: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

fn provider_error<E, R>(err: SdkError<E, R>) -> CertError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    CertError::Provider(DisplayErrorContext(&err).to_string())
}

fn build_error(err: BuildError) -> CertError {
    CertError::InvalidRequest(err.to_string())
}
