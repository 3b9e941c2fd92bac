//! CloudFront implementation of [`CdnProvider`]
//!
//! Every write rebuilds the full distribution config from
//! [`DistributionSettings`] so the enforced invariants (https-only origin,
//! redirect-to-https viewers, lowest price class, ...) are re-applied on each
//! update, not only on create.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_cloudfront::error::{BuildError, DisplayErrorContext, SdkError};
use aws_sdk_cloudfront::types::{
    Aliases, AllowedMethods, CachedMethods, CookiePreference, CustomHeaders, CustomOriginConfig,
    DefaultCacheBehavior, DistributionConfig, DistributionConfigWithTags, ForwardedValues,
    Headers, ItemSelection, Method, MinimumProtocolVersion, Origin, OriginCustomHeader,
    OriginProtocolPolicy, OriginSslProtocols, Origins, PriceClass, SslProtocol, SslSupportMethod,
    Tag, Tags, TrustedSigners, ViewerCertificate, ViewerProtocolPolicy,
};
use aws_sdk_cloudfront::Client;
use tracing::{debug, info};

use crate::cdn::{
    CdnError, CdnProvider, CreateDistribution, Distribution, DistributionSettings,
    DistributionUpdate,
};

/// Upper bound on cache lifetime (366 days)
pub const MAX_TTL: i64 = 31_622_400;

const ORIGIN_READ_TIMEOUT_SECS: i32 = 60;
const ORIGIN_KEEPALIVE_TIMEOUT_SECS: i32 = 5;
const DISTRIBUTION_COMMENT: &str = "cdn route service";

/// CloudFront-backed CDN adapter
pub struct CloudFrontProvider {
    client: Client,
    /// Extra headers injected on every origin request
    origin_headers: BTreeMap<String, String>,
}

impl CloudFrontProvider {
    pub fn new(config: &aws_config::SdkConfig, origin_headers: BTreeMap<String, String>) -> Self {
        Self::from_client(Client::new(config), origin_headers)
    }

    pub fn from_client(client: Client, origin_headers: BTreeMap<String, String>) -> Self {
        Self {
            client,
            origin_headers,
        }
    }

    /// Current settings plus the etag needed to write them back
    async fn current_settings(&self, id: &str) -> Result<(DistributionSettings, String), CdnError> {
        let output = self
            .client
            .get_distribution_config()
            .id(id)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_distribution())
                    .unwrap_or(false)
                {
                    CdnError::NotFound(id.to_string())
                } else {
                    provider_error(err)
                }
            })?;

        let config = output
            .distribution_config()
            .ok_or_else(|| CdnError::Provider(format!("distribution {} has no config", id)))?;
        let e_tag = output
            .e_tag()
            .ok_or_else(|| CdnError::Provider(format!("distribution {} has no etag", id)))?;

        Ok((settings_from_config(config), e_tag.to_string()))
    }

    async fn write_settings(
        &self,
        id: &str,
        settings: &DistributionSettings,
        e_tag: &str,
        enabled: bool,
    ) -> Result<Distribution, CdnError> {
        let config = build_distribution_config(settings, &self.origin_headers, enabled)?;

        let output = self
            .client
            .update_distribution()
            .id(id)
            .if_match(e_tag)
            .distribution_config(config)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_cname_already_exists())
                    .unwrap_or(false)
                {
                    CdnError::AliasConflict(settings.aliases.join(","))
                } else {
                    provider_error(err)
                }
            })?;

        let distribution = output
            .distribution()
            .ok_or_else(|| CdnError::Provider(format!("update of {} returned no distribution", id)))?;

        from_distribution(distribution)
    }
}

#[async_trait]
impl CdnProvider for CloudFrontProvider {
    async fn create(&self, request: &CreateDistribution) -> Result<Distribution, CdnError> {
        let config = build_distribution_config(&request.settings(), &self.origin_headers, true)?;

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

        let with_tags = DistributionConfigWithTags::builder()
            .distribution_config(config)
            .tags(Tags::builder().set_items(Some(tags)).build())
            .build();

        let output = self
            .client
            .create_distribution_with_tags()
            .distribution_config_with_tags(with_tags)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_cname_already_exists())
                    .unwrap_or(false)
                {
                    CdnError::AliasConflict(request.aliases.join(","))
                } else {
                    provider_error(err)
                }
            })?;

        let distribution = output
            .distribution()
            .ok_or_else(|| CdnError::Provider("create returned no distribution".to_string()))?;
        let distribution = from_distribution(distribution)?;

        info!(
            caller_reference = %request.caller_reference,
            dist_id = %distribution.id,
            domain = %distribution.domain_name,
            "CloudFront distribution created"
        );

        Ok(distribution)
    }

    async fn get(&self, id: &str) -> Result<Distribution, CdnError> {
        let output = self
            .client
            .get_distribution()
            .id(id)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_distribution())
                    .unwrap_or(false)
                {
                    CdnError::NotFound(id.to_string())
                } else {
                    provider_error(err)
                }
            })?;

        let distribution = output
            .distribution()
            .ok_or_else(|| CdnError::NotFound(id.to_string()))?;

        from_distribution(distribution)
    }

    async fn update(
        &self,
        id: &str,
        update: &DistributionUpdate,
    ) -> Result<Distribution, CdnError> {
        let (mut settings, e_tag) = self.current_settings(id).await?;
        settings.apply(update);

        debug!(dist_id = %id, origin = %settings.origin, "updating distribution");
        self.write_settings(id, &settings, &e_tag, true).await
    }

    async fn set_certificate_and_aliases(
        &self,
        id: &str,
        certificate_arn: &str,
        aliases: &[String],
    ) -> Result<(), CdnError> {
        let (mut settings, e_tag) = self.current_settings(id).await?;
        settings.aliases = aliases.to_vec();
        settings.certificate_arn = Some(certificate_arn.to_string());

        self.write_settings(id, &settings, &e_tag, true).await?;
        info!(dist_id = %id, arn = %certificate_arn, "certificate and aliases attached");

        Ok(())
    }

    async fn disable(&self, id: &str) -> Result<(), CdnError> {
        let (settings, e_tag) = self.current_settings(id).await?;

        self.write_settings(id, &settings, &e_tag, false).await?;
        info!(dist_id = %id, "distribution disabled");

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, CdnError> {
        let output = match self.client.get_distribution().id(id).send().await {
            Ok(output) => output,
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_distribution())
                    .unwrap_or(false) =>
            {
                // Already gone
                return Ok(true);
            }
            Err(err) => return Err(provider_error(err)),
        };

        let distribution = match output.distribution() {
            Some(distribution) => from_distribution(distribution)?,
            None => return Ok(true),
        };
        if distribution.enabled || !distribution.is_deployed() {
            debug!(dist_id = %id, status = %distribution.status, "distribution still draining");
            return Ok(false);
        }

        let e_tag = output
            .e_tag()
            .ok_or_else(|| CdnError::Provider(format!("distribution {} has no etag", id)))?;

        match self
            .client
            .delete_distribution()
            .id(id)
            .if_match(e_tag)
            .send()
            .await
        {
            Ok(_) => {
                info!(dist_id = %id, "distribution deleted");
                Ok(true)
            }
            Err(err) => match err.as_service_error() {
                Some(e) if e.is_distribution_not_disabled() => Ok(false),
                Some(e) if e.is_no_such_distribution() => Ok(true),
                _ => Err(provider_error(err)),
            },
        }
    }

    async fn ping(&self) -> Result<(), CdnError> {
        self.client
            .list_distributions()
            .max_items(1)
            .send()
            .await
            .map_err(provider_error)?;
        Ok(())
    }
}

fn provider_error<E, R>(err: SdkError<E, R>) -> CdnError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    CdnError::Provider(DisplayErrorContext(&err).to_string())
}

fn build_error(err: BuildError) -> CdnError {
    CdnError::InvalidConfig(err.to_string())
}

fn origin_id(origin: &str) -> String {
    format!("cdn-route-{}", origin)
}

fn from_distribution(
    distribution: &aws_sdk_cloudfront::types::Distribution,
) -> Result<Distribution, CdnError> {
    let config = distribution.distribution_config().ok_or_else(|| {
        CdnError::Provider(format!("distribution {} has no config", distribution.id()))
    })?;

    Ok(Distribution {
        id: distribution.id().to_string(),
        domain_name: distribution.domain_name().to_string(),
        status: distribution.status().to_string(),
        enabled: config.enabled(),
        settings: settings_from_config(config),
    })
}

/// Read back the broker-controlled settings of a distribution config
pub fn settings_from_config(config: &DistributionConfig) -> DistributionSettings {
    let behavior = config.default_cache_behavior();
    let forwarded = behavior.and_then(|b| b.forwarded_values());

    DistributionSettings {
        caller_reference: config.caller_reference().to_string(),
        aliases: config
            .aliases()
            .map(|aliases| aliases.items().to_vec())
            .unwrap_or_default(),
        origin: config
            .origins()
            .and_then(|origins| origins.items().first())
            .map(|origin| origin.domain_name().to_string())
            .unwrap_or_default(),
        default_ttl: behavior.and_then(|b| b.default_ttl()).unwrap_or_default(),
        forwarded_headers: forwarded
            .and_then(|f| f.headers())
            .map(|headers| headers.items().to_vec())
            .unwrap_or_default(),
        forward_cookies: forwarded
            .and_then(|f| f.cookies())
            .map(|cookies| cookies.forward().as_str() == "all")
            .unwrap_or(true),
        certificate_arn: config
            .viewer_certificate()
            .and_then(|cert| cert.acm_certificate_arn())
            .map(str::to_string),
    }
}

/// Build a full distribution config with the enforced invariants applied
pub fn build_distribution_config(
    settings: &DistributionSettings,
    origin_headers: &BTreeMap<String, String>,
    enabled: bool,
) -> Result<DistributionConfig, CdnError> {
    if settings.origin.is_empty() {
        return Err(CdnError::InvalidConfig("origin must not be empty".to_string()));
    }

    let origin_id = origin_id(&settings.origin);

    let custom_headers = origin_headers
        .iter()
        .map(|(name, value)| {
            OriginCustomHeader::builder()
                .header_name(name)
                .header_value(value)
                .build()
                .map_err(build_error)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let origin = Origin::builder()
        .id(&origin_id)
        .domain_name(&settings.origin)
        .origin_path("")
        .custom_headers(
            CustomHeaders::builder()
                .quantity(custom_headers.len() as i32)
                .set_items(non_empty(custom_headers))
                .build()
                .map_err(build_error)?,
        )
        .custom_origin_config(
            CustomOriginConfig::builder()
                .http_port(80)
                .https_port(443)
                .origin_protocol_policy(OriginProtocolPolicy::from("https-only"))
                .origin_ssl_protocols(
                    OriginSslProtocols::builder()
                        .quantity(1)
                        .items(SslProtocol::from("TLSv1.2"))
                        .build()
                        .map_err(build_error)?,
                )
                .origin_read_timeout(ORIGIN_READ_TIMEOUT_SECS)
                .origin_keepalive_timeout(ORIGIN_KEEPALIVE_TIMEOUT_SECS)
                .build()
                .map_err(build_error)?,
        )
        .build()
        .map_err(build_error)?;

    let cookies = CookiePreference::builder()
        .forward(ItemSelection::from(if settings.forward_cookies {
            "all"
        } else {
            "none"
        }))
        .build()
        .map_err(build_error)?;

    let headers = Headers::builder()
        .quantity(settings.forwarded_headers.len() as i32)
        .set_items(non_empty(settings.forwarded_headers.clone()))
        .build()
        .map_err(build_error)?;

    let forwarded_values = ForwardedValues::builder()
        .query_string(true)
        .cookies(cookies)
        .headers(headers)
        .build()
        .map_err(build_error)?;

    let allowed_methods = AllowedMethods::builder()
        .quantity(7)
        .set_items(Some(vec![
            Method::Head,
            Method::Get,
            Method::Options,
            Method::Put,
            Method::Post,
            Method::Patch,
            Method::Delete,
        ]))
        .cached_methods(
            CachedMethods::builder()
                .quantity(2)
                .set_items(Some(vec![Method::Head, Method::Get]))
                .build()
                .map_err(build_error)?,
        )
        .build()
        .map_err(build_error)?;

    let default_cache_behavior = DefaultCacheBehavior::builder()
        .target_origin_id(&origin_id)
        .forwarded_values(forwarded_values)
        .trusted_signers(
            TrustedSigners::builder()
                .enabled(false)
                .quantity(0)
                .build()
                .map_err(build_error)?,
        )
        .viewer_protocol_policy(ViewerProtocolPolicy::RedirectToHttps)
        .allowed_methods(allowed_methods)
        .min_ttl(0)
        .default_ttl(settings.default_ttl)
        .max_ttl(MAX_TTL)
        .build()
        .map_err(build_error)?;

    let viewer_certificate = match settings.certificate_arn {
        Some(ref arn) => ViewerCertificate::builder()
            .acm_certificate_arn(arn)
            .ssl_support_method(SslSupportMethod::from("sni-only"))
            .minimum_protocol_version(MinimumProtocolVersion::from("TLSv1.2_2021"))
            .build(),
        None => ViewerCertificate::builder()
            .cloud_front_default_certificate(true)
            .build(),
    };

    DistributionConfig::builder()
        .caller_reference(&settings.caller_reference)
        .aliases(
            Aliases::builder()
                .quantity(settings.aliases.len() as i32)
                .set_items(non_empty(settings.aliases.clone()))
                .build()
                .map_err(build_error)?,
        )
        .default_root_object("")
        .origins(
            Origins::builder()
                .quantity(1)
                .items(origin)
                .build()
                .map_err(build_error)?,
        )
        .default_cache_behavior(default_cache_behavior)
        .comment(DISTRIBUTION_COMMENT)
        .price_class(PriceClass::from("PriceClass_100"))
        .enabled(enabled)
        .is_ipv6_enabled(true)
        .viewer_certificate(viewer_certificate)
        .build()
        .map_err(build_error)
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
