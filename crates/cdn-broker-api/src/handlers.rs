use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use cdn_broker_cloud::DomainValidationChallenge;
use cdn_broker_control::RouteManagerError;
use cdn_broker_db::{Route, RouteState};

use crate::models::*;
use crate::params::{ParamsError, RouteParams};
use crate::AppState;

/// Bound on each dependency health check
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

type ApiError = (StatusCode, Json<ErrorResponse>);

fn manager_error(err: RouteManagerError) -> ApiError {
    let status = match &err {
        RouteManagerError::InstanceDoesNotExist(_) => StatusCode::GONE,
        RouteManagerError::InstanceAlreadyExists(_) => StatusCode::CONFLICT,
        RouteManagerError::DomainAlreadyClaimed { .. } | RouteManagerError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!(error = %err, "Broker request failed");
    }

    (status, Json(ErrorResponse::new(err.to_string())))
}

fn params_error(err: ParamsError) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(err.to_string())))
}

/// Run a mutation on its own task.
///
/// Dropping the request future (client disconnect) leaves the task running,
/// so cloud side effects are always followed by their persisted write.
async fn run_to_completion<T, F>(mutation: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, RouteManagerError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(mutation).await {
        Ok(result) => result.map_err(manager_error),
        Err(err) => {
            error!(error = %err, "Broker mutation task failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("internal error")),
            ))
        }
    }
}

fn require_async(query: &AsyncQuery) -> Result<(), ApiError> {
    if query.accepts_incomplete == Some(true) {
        return Ok(());
    }

    Err((
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ErrorResponse::with_code(
            "AsyncRequired",
            "This service plan requires client support for asynchronous service operations.",
        )),
    ))
}

/// Broker catalog
#[utoipa::path(
    get,
    path = "/v2/catalog",
    responses(
        (status = 200, description = "Service catalog", body = CatalogResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorResponse)
    ),
    tag = "broker"
)]
pub async fn catalog(State(state): State<Arc<AppState>>) -> Json<CatalogResponse> {
    Json(CatalogResponse {
        services: vec![CatalogService {
            id: state.catalog.service_id.clone(),
            name: "cdn-route".to_string(),
            description: "Custom domains with TLS in front of your application, served by a CDN"
                .to_string(),
            bindable: false,
            plan_updateable: true,
            tags: vec!["cdn".to_string(), "route".to_string()],
            plans: vec![CatalogPlan {
                id: state.catalog.plan_id.clone(),
                name: "cdn-route".to_string(),
                description: "CDN distribution with a managed certificate".to_string(),
                free: true,
            }],
        }],
    })
}

/// Provision a route: create the distribution and request its certificate
#[utoipa::path(
    put,
    path = "/v2/service_instances/{instance_id}",
    params(
        ("instance_id" = String, Path, description = "Service instance ID"),
        AsyncQuery
    ),
    request_body = ProvisionRequest,
    responses(
        (status = 202, description = "Provisioning started", body = ProvisionResponse),
        (status = 400, description = "Invalid parameters or domain in use", body = ErrorResponse),
        (status = 409, description = "Instance already exists", body = ErrorResponse),
        (status = 422, description = "accepts_incomplete=true is required", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "broker"
)]
pub async fn provision(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    Json(request): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    require_async(&query)?;

    let mut create = RouteParams::parse(request.parameters.as_ref())
        .and_then(|params| params.into_create(&instance_id, &state.defaults))
        .map_err(params_error)?;
    create.tags = provision_tags(&instance_id, &request);

    info!(instance_id = %instance_id, domains = ?create.domains, "Provisioning instance");
    let manager = state.manager.clone();
    run_to_completion(async move { manager.create(create).await }).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ProvisionResponse {
            dashboard_url: None,
            operation: Some("provision".to_string()),
        }),
    ))
}

fn provision_tags(instance_id: &str, request: &ProvisionRequest) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("Instance".to_string(), instance_id.to_string());
    tags.insert("Service".to_string(), request.service_id.clone());
    tags.insert("Plan".to_string(), request.plan_id.clone());
    if let Some(ref org) = request.organization_guid {
        tags.insert("Organization".to_string(), org.clone());
    }
    if let Some(ref space) = request.space_guid {
        tags.insert("Space".to_string(), space.clone());
    }
    tags.retain(|_, value| !value.is_empty());
    tags
}

/// Update cache settings, origin or domains
#[utoipa::path(
    patch,
    path = "/v2/service_instances/{instance_id}",
    params(
        ("instance_id" = String, Path, description = "Service instance ID"),
        AsyncQuery
    ),
    request_body = UpdateRequest,
    responses(
        (status = 200, description = "Update applied", body = OperationResponse),
        (status = 202, description = "Update waiting for certificate validation", body = OperationResponse),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
        (status = 410, description = "Instance does not exist", body = ErrorResponse),
        (status = 422, description = "accepts_incomplete=true is required", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "broker"
)]
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    Json(request): Json<UpdateRequest>,
) -> Result<(StatusCode, Json<OperationResponse>), ApiError> {
    require_async(&query)?;

    let update = RouteParams::parse(request.parameters.as_ref())
        .and_then(RouteParams::into_update)
        .map_err(params_error)?;

    info!(instance_id = %instance_id, "Updating instance");
    let manager = state.manager.clone();
    let id = instance_id.clone();
    let is_async = run_to_completion(async move { manager.update(&id, update).await }).await?;

    if is_async {
        Ok((
            StatusCode::ACCEPTED,
            Json(OperationResponse {
                operation: Some("update".to_string()),
            }),
        ))
    } else {
        Ok((StatusCode::OK, Json(OperationResponse::default())))
    }
}

/// Disable the distribution; the reconciler deletes it once drained
#[utoipa::path(
    delete,
    path = "/v2/service_instances/{instance_id}",
    params(
        ("instance_id" = String, Path, description = "Service instance ID"),
        AsyncQuery
    ),
    responses(
        (status = 202, description = "Deprovisioning started", body = OperationResponse),
        (status = 410, description = "Instance does not exist", body = ErrorResponse),
        (status = 422, description = "accepts_incomplete=true is required", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "broker"
)]
pub async fn deprovision(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
) -> Result<(StatusCode, Json<OperationResponse>), ApiError> {
    require_async(&query)?;

    let mut route = state
        .manager
        .get(&instance_id)
        .await
        .map_err(manager_error)?;

    let accepted = (
        StatusCode::ACCEPTED,
        Json(OperationResponse {
            operation: Some("deprovision".to_string()),
        }),
    );

    match route.state {
        RouteState::Deprovisioned => {
            return Err((
                StatusCode::GONE,
                Json(ErrorResponse::new(format!(
                    "instance {} is already deprovisioned",
                    instance_id
                ))),
            ))
        }
        RouteState::Deprovisioning => return Ok(accepted),
        _ => {}
    }

    info!(instance_id = %instance_id, dist_id = %route.dist_id, "Deprovisioning instance");
    let manager = state.manager.clone();
    run_to_completion(async move { manager.disable(&mut route).await }).await?;

    Ok(accepted)
}

/// Progress of the last asynchronous operation
#[utoipa::path(
    get,
    path = "/v2/service_instances/{instance_id}/last_operation",
    params(
        ("instance_id" = String, Path, description = "Service instance ID"),
        LastOperationQuery
    ),
    responses(
        (status = 200, description = "Operation state", body = LastOperationResponse),
        (status = 410, description = "Instance does not exist", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "broker"
)]
pub async fn last_operation(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(_query): Query<LastOperationQuery>,
) -> Result<Json<LastOperationResponse>, ApiError> {
    let route = state
        .manager
        .get(&instance_id)
        .await
        .map_err(manager_error)?;

    let challenges = if route.state == RouteState::Provisioning {
        state
            .manager
            .get_dns_challenges(&route, true)
            .await
            .unwrap_or_else(|err| {
                warn!(instance_id = %instance_id, error = %err, "Could not load DNS challenges");
                Vec::new()
            })
    } else {
        Vec::new()
    };

    debug!(instance_id = %instance_id, state = %route.state, "Last operation");

    Ok(Json(LastOperationResponse {
        state: last_operation_state(route.state),
        description: describe_route(&route, &challenges),
    }))
}

/// Instance parameters and DNS instructions
#[utoipa::path(
    get,
    path = "/v2/service_instances/{instance_id}",
    params(
        ("instance_id" = String, Path, description = "Service instance ID")
    ),
    responses(
        (status = 200, description = "Instance parameters", body = InstanceResponse),
        (status = 410, description = "Instance does not exist", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "broker"
)]
pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let route = state
        .manager
        .get(&instance_id)
        .await
        .map_err(manager_error)?;

    let challenges = state
        .manager
        .get_dns_challenges(&route, false)
        .await
        .map_err(manager_error)?;

    // Live settings win; fall back to what was last persisted
    let (forwarded_headers, forward_cookies, cache_ttl) =
        match state.manager.get_cdn_configuration(&route).await {
            Ok(distribution) => (
                distribution.settings.forwarded_headers,
                distribution.settings.forward_cookies,
                distribution.settings.default_ttl,
            ),
            Err(err) => {
                warn!(instance_id = %instance_id, error = %err, "Could not read distribution config");
                (
                    route.forwarded_headers.clone(),
                    route.forward_cookies,
                    route.default_ttl,
                )
            }
        };

    Ok(Json(InstanceResponse {
        service_id: state.catalog.service_id.clone(),
        plan_id: state.catalog.plan_id.clone(),
        parameters: InstanceParameters {
            cloudfront_domain: route.domain_internal.clone(),
            cloudfront_distribution_id: route.dist_id.clone(),
            forwarded_headers,
            forward_cookies,
            cache_ttl,
            dns_records: challenges.into_iter().map(dns_record).collect(),
        },
    }))
}

/// Bindings are not supported
#[utoipa::path(
    put,
    path = "/v2/service_instances/{instance_id}/service_bindings/{binding_id}",
    params(
        ("instance_id" = String, Path, description = "Service instance ID"),
        ("binding_id" = String, Path, description = "Binding ID")
    ),
    responses(
        (status = 400, description = "Bindings are not supported", body = ErrorResponse)
    ),
    tag = "broker"
)]
pub async fn bind(Path((instance_id, binding_id)): Path<(String, String)>) -> ApiError {
    debug!(instance_id = %instance_id, binding_id = %binding_id, "Rejecting bind");
    bindings_unsupported()
}

/// Bindings are not supported
#[utoipa::path(
    delete,
    path = "/v2/service_instances/{instance_id}/service_bindings/{binding_id}",
    params(
        ("instance_id" = String, Path, description = "Service instance ID"),
        ("binding_id" = String, Path, description = "Binding ID")
    ),
    responses(
        (status = 400, description = "Bindings are not supported", body = ErrorResponse)
    ),
    tag = "broker"
)]
pub async fn unbind(Path((instance_id, binding_id)): Path<(String, String)>) -> ApiError {
    debug!(instance_id = %instance_id, binding_id = %binding_id, "Rejecting unbind");
    bindings_unsupported()
}

fn bindings_unsupported() -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new("service does not support bindings")),
    )
}

/// Map a route state onto the broker's three operation states
pub fn last_operation_state(state: RouteState) -> LastOperationState {
    match state {
        RouteState::Provisioning | RouteState::Deprovisioning => LastOperationState::InProgress,
        RouteState::Provisioned | RouteState::Deprovisioned => LastOperationState::Succeeded,
        RouteState::Failed | RouteState::Conflict | RouteState::TimedOut => {
            LastOperationState::Failed
        }
    }
}

/// Human-readable description of a route, with DNS instructions while provisioning
pub fn describe_route(route: &Route, challenges: &[DomainValidationChallenge]) -> String {
    let summary = format!("[{} => {}]", route.domains().join(", "), route.origin);

    match route.state {
        RouteState::Provisioning => {
            let mut description = format!(
                "Provisioning in progress {}; CNAME or ALIAS domain(s) {} to {} and create the following DNS validation record(s):",
                summary,
                route.domains().join(", "),
                route.domain_internal
            );
            if challenges.is_empty() {
                description.push_str("\n(validation records are not available yet)");
            }
            for challenge in challenges {
                description.push_str(&format!(
                    "\nname: {}, type: {}, value: {} ({}, {})",
                    challenge.record_name,
                    challenge.record_type,
                    challenge.record_value,
                    challenge.domain,
                    challenge.validation_status
                ));
            }
            description
        }
        RouteState::Deprovisioning => format!("Deprovisioning in progress {}", summary),
        RouteState::Provisioned => format!(
            "Service instance provisioned {}; CDN domain {}",
            summary, route.domain_internal
        ),
        RouteState::Deprovisioned => format!("Service instance deprovisioned {}", summary),
        RouteState::Conflict => format!(
            "Service instance failed {}: one or more domains are already associated with another CDN distribution",
            summary
        ),
        RouteState::Failed => format!(
            "Service instance failed {}: certificate validation failed",
            summary
        ),
        RouteState::TimedOut => format!(
            "Service instance failed {}: certificate validation did not complete in time",
            summary
        ),
    }
}

fn dns_record(challenge: DomainValidationChallenge) -> DnsRecord {
    DnsRecord {
        validating_domain_name: challenge.domain,
        challenge_dns_record: challenge.record_name,
        challenges_dns_record_type: challenge.record_type,
        challenges_dns_record_value: challenge.record_value,
        status: challenge.validation_status,
    }
}

fn health_response(
    check: &str,
    result: Result<Result<(), String>, tokio::time::error::Elapsed>,
) -> (StatusCode, Json<HealthResponse>) {
    let error = match result {
        Ok(Ok(())) => {
            return (
                StatusCode::OK,
                Json(HealthResponse {
                    status: "ok".to_string(),
                    check: check.to_string(),
                    error: None,
                }),
            )
        }
        Ok(Err(err)) => err,
        Err(_) => format!("timed out after {}s", HEALTH_CHECK_TIMEOUT.as_secs()),
    };

    warn!(check = %check, error = %error, "Health check failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(HealthResponse {
            status: "unavailable".to_string(),
            check: check.to_string(),
            error: Some(error),
        }),
    )
}

/// Liveness of the HTTP server itself
#[utoipa::path(
    get,
    path = "/healthcheck/http",
    responses(
        (status = 200, description = "Server is up", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_http() -> (StatusCode, Json<HealthResponse>) {
    health_response("http", Ok(Ok(())))
}

/// Database reachability
#[utoipa::path(
    get,
    path = "/healthcheck/database",
    responses(
        (status = 200, description = "Database reachable", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_database(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let result = tokio::time::timeout(
        HEALTH_CHECK_TIMEOUT,
        state.manager.store().connection().ping(),
    )
    .await
    .map(|ping| ping.map_err(|err| err.to_string()));

    health_response("database", result)
}

/// CDN provider reachability
#[utoipa::path(
    get,
    path = "/healthcheck/cloudfront",
    responses(
        (status = 200, description = "CDN provider reachable", body = HealthResponse),
        (status = 503, description = "CDN provider unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_cloudfront(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.manager.cdn().ping())
        .await
        .map(|ping| ping.map_err(|err| err.to_string()));

    health_response("cloudfront", result)
}

/// Certificate service reachability
#[utoipa::path(
    get,
    path = "/healthcheck/acm",
    responses(
        (status = 200, description = "Certificate service reachable", body = HealthResponse),
        (status = 503, description = "Certificate service unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_acm(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.manager.certs().ping())
        .await
        .map(|ping| ping.map_err(|err| err.to_string()));

    health_response("acm", result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(state: RouteState) -> Route {
        let mut route = Route::new(
            "inst-1",
            &["a.example.com".to_string(), "b.example.com".to_string()],
            "origin.example.com",
            3600,
            vec!["Host".to_string()],
            true,
        );
        route.state = state;
        route.domain_internal = "d111.cloudfront.net".to_string();
        route
    }

    #[test]
    fn test_last_operation_state_mapping() {
        use LastOperationState::*;

        assert_eq!(last_operation_state(RouteState::Provisioning), InProgress);
        assert_eq!(last_operation_state(RouteState::Deprovisioning), InProgress);
        assert_eq!(last_operation_state(RouteState::Provisioned), Succeeded);
        assert_eq!(last_operation_state(RouteState::Deprovisioned), Succeeded);
        assert_eq!(last_operation_state(RouteState::Failed), Failed);
        assert_eq!(last_operation_state(RouteState::Conflict), Failed);
        assert_eq!(last_operation_state(RouteState::TimedOut), Failed);
    }

    #[test]
    fn test_provisioning_description_lists_records() {
        let challenges = vec![DomainValidationChallenge {
            domain: "a.example.com".to_string(),
            record_name: "_abc.a.example.com.".to_string(),
            record_type: "CNAME".to_string(),
            record_value: "_def.acm-validations.aws.".to_string(),
            validation_status: "PENDING_VALIDATION".to_string(),
        }];

        let description = describe_route(&route(RouteState::Provisioning), &challenges);

        assert!(description.contains("a.example.com, b.example.com => origin.example.com"));
        assert!(description.contains("d111.cloudfront.net"));
        assert!(description.contains("name: _abc.a.example.com., type: CNAME"));
    }

    #[test]
    fn test_terminal_descriptions_include_domains_and_origin() {
        for state in [
            RouteState::Provisioned,
            RouteState::Deprovisioned,
            RouteState::Conflict,
            RouteState::Failed,
            RouteState::TimedOut,
        ] {
            let description = describe_route(&route(state), &[]);
            assert!(description.contains("a.example.com"), "{state}");
            assert!(description.contains("origin.example.com"), "{state}");
        }
    }

    #[test]
    fn test_async_is_required() {
        let (status, Json(body)) = require_async(&AsyncQuery::default()).unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.error.as_deref(), Some("AsyncRequired"));

        assert!(require_async(&AsyncQuery {
            accepts_incomplete: Some(true),
            ..Default::default()
        })
        .is_ok());
    }
}
