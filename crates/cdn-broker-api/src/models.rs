//! Service broker wire types

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable error code (`AsyncRequired`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable message
    pub description: String,
}

impl ErrorResponse {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            error: None,
            description: description.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: Some(code.into()),
            description: description.into(),
        }
    }
}

/// Broker catalog
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CatalogResponse {
    pub services: Vec<CatalogService>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CatalogService {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub plan_updateable: bool,
    pub tags: Vec<String>,
    pub plans: Vec<CatalogPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CatalogPlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,
}

/// `accepts_incomplete` and friends
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct AsyncQuery {
    /// Must be `true`; every mutation completes asynchronously
    pub accepts_incomplete: Option<bool>,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct LastOperationQuery {
    pub operation: Option<String>,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
}

/// Provision request body
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProvisionRequest {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub organization_guid: Option<String>,
    #[serde(default)]
    pub space_guid: Option<String>,
    /// Route parameters, see [`crate::params::RouteParams`]
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProvisionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

/// Update request body
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateRequest {
    pub service_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub parameters: Option<serde_json::Value>,
}

/// Reply to update and deprovision
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct OperationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    pub description: String,
}

/// One DNS record the tenant must publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DnsRecord {
    pub validating_domain_name: String,
    pub challenge_dns_record: String,
    pub challenges_dns_record_type: String,
    pub challenges_dns_record_value: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InstanceParameters {
    pub cloudfront_domain: String,
    pub cloudfront_distribution_id: String,
    pub forwarded_headers: Vec<String>,
    pub forward_cookies: bool,
    pub cache_ttl: i64,
    pub dns_records: Vec<DnsRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InstanceResponse {
    pub service_id: String,
    pub plan_id: String,
    pub parameters: InstanceParameters,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` or `unavailable`
    pub status: String,
    /// Which dependency was checked
    pub check: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
