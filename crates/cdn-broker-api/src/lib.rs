//! Service broker HTTP facade
//!
//! Translates broker API calls into [`RouteManager`] operations. Everything
//! under `/v2` sits behind HTTP Basic authentication; the health checks are
//! public.

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod params;

use axum::{
    middleware as axum_middleware,
    routing::{get, put},
    Router,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use cdn_broker_control::RouteManager;

pub use middleware::BasicCredentials;
pub use params::RouteDefaults;

/// Identifiers advertised in the catalog
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub service_id: String,
    pub plan_id: String,
}

/// Application state shared across handlers
pub struct AppState {
    pub manager: Arc<RouteManager>,
    pub defaults: RouteDefaults,
    pub catalog: CatalogConfig,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "CDN Broker API",
        version = "0.1.0",
        description = "Service broker provisioning CDN distributions with managed certificates"
    ),
    paths(
        handlers::catalog,
        handlers::provision,
        handlers::update,
        handlers::deprovision,
        handlers::last_operation,
        handlers::get_instance,
        handlers::bind,
        handlers::unbind,
        handlers::health_http,
        handlers::health_database,
        handlers::health_cloudfront,
        handlers::health_acm,
    ),
    components(
        schemas(
            models::ErrorResponse,
            models::CatalogResponse,
            models::CatalogService,
            models::CatalogPlan,
            models::ProvisionRequest,
            models::ProvisionResponse,
            models::UpdateRequest,
            models::OperationResponse,
            models::LastOperationState,
            models::LastOperationResponse,
            models::DnsRecord,
            models::InstanceParameters,
            models::InstanceResponse,
            models::HealthResponse,
        )
    ),
    tags(
        (name = "broker", description = "Service broker endpoints"),
        (name = "system", description = "Health check endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Credentials the platform presents on every `/v2` call
    pub credentials: BasicCredentials,
    /// PEM certificate; TLS is terminated in-process when both paths are set
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();
        let credentials = Arc::new(self.config.credentials.clone());

        let public_router = Router::new()
            .route("/healthcheck/http", get(handlers::health_http))
            .route("/healthcheck/database", get(handlers::health_database))
            .route("/healthcheck/cloudfront", get(handlers::health_cloudfront))
            .route("/healthcheck/acm", get(handlers::health_acm))
            .with_state(self.state.clone());

        let protected_router = Router::new()
            .route("/v2/catalog", get(handlers::catalog))
            .route(
                "/v2/service_instances/{instance_id}",
                put(handlers::provision)
                    .patch(handlers::update)
                    .delete(handlers::deprovision)
                    .get(handlers::get_instance),
            )
            .route(
                "/v2/service_instances/{instance_id}/last_operation",
                get(handlers::last_operation),
            )
            .route(
                "/v2/service_instances/{instance_id}/service_bindings/{binding_id}",
                put(handlers::bind).delete(handlers::unbind),
            )
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                credentials,
                middleware::require_basic_auth,
            ));

        Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(public_router)
            .merge(protected_router)
            .layer(TraceLayer::new_for_http())
    }

    /// Start the API server
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        match (&self.config.tls_cert_path, &self.config.tls_key_path) {
            (Some(cert), Some(key)) => {
                let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to load TLS certificate: {}", e))?;

                info!("Starting broker on https://{}", self.config.bind_addr);
                axum_server::bind_rustls(self.config.bind_addr, tls)
                    .serve(router.into_make_service())
                    .await
                    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
            }
            (None, None) => {
                info!("Starting broker on http://{}", self.config.bind_addr);
                let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

                axum::serve(listener, router)
                    .await
                    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
            }
            _ => anyhow::bail!("TLS requires both a certificate and a key"),
        }

        Ok(())
    }
}
