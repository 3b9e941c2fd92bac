//! CDN service broker
//!
//! Serves the broker API and runs the reconciliation scheduler, or runs a
//! single sweep and exits.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cdn_broker_api::{
    ApiServer, ApiServerConfig, AppState, BasicCredentials, CatalogConfig, RouteDefaults,
};
use cdn_broker_cloud::{load_aws_config, AcmProvider, CloudFrontProvider};
use cdn_broker_control::{ManagerConfig, RouteManager, Scheduler};
use cdn_broker_db::RouteStore;

use config::BrokerArgs;

/// CDN service broker - custom domains with managed certificates
#[derive(Parser, Debug)]
#[command(name = "cdn-broker")]
#[command(about = "Provision CDN distributions with managed TLS certificates", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    args: BrokerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the broker API and run the scheduler (default)
    Serve,
    /// Run one reconciliation pass over changing routes and exit
    CheckRoutes,
    /// Delete unused certificates this broker requested and exit
    DeleteOrphanedCerts,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    init_logging(&cli.args.log_level)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.args).await,
        Commands::CheckRoutes => {
            let manager = build_manager(&cli.args).await?;
            let report = manager
                .check_routes_to_update()
                .await
                .context("Route sweep failed")?;
            info!(
                polled = report.polled,
                conflict = report.conflict,
                failed = report.failed,
                timed_out = report.timed_out,
                errors = report.errors,
                "Route sweep finished"
            );
            Ok(())
        }
        Commands::DeleteOrphanedCerts => {
            let manager = build_manager(&cli.args).await?;
            let report = manager
                .delete_orphaned_certs()
                .await
                .context("Orphan sweep failed")?;
            info!(
                examined = report.examined,
                deleted = report.deleted,
                errors = report.errors,
                "Orphan sweep finished"
            );
            Ok(())
        }
        Commands::Migrate => {
            connect_store(&cli.args).await?;
            Ok(())
        }
    }
}

async fn connect_store(args: &BrokerArgs) -> Result<RouteStore> {
    let db = cdn_broker_db::connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;
    cdn_broker_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;

    Ok(RouteStore::new(db))
}

async fn build_manager(args: &BrokerArgs) -> Result<Arc<RouteManager>> {
    let store = connect_store(args).await?;

    let aws = load_aws_config(args.aws_region.clone()).await;
    let cdn = CloudFrontProvider::new(&aws, args.origin_headers()?);
    let certs = AcmProvider::new(&aws, args.broker_tag.clone());

    let config = ManagerConfig {
        broker_tag: args.broker_tag.clone(),
        ..Default::default()
    };

    Ok(Arc::new(RouteManager::new(
        store,
        Arc::new(cdn),
        Arc::new(certs),
        config,
    )))
}

async fn serve(args: BrokerArgs) -> Result<()> {
    args.validate_for_serve()?;

    let manager = build_manager(&args).await?;

    let scheduler = Scheduler::new(&args.schedule, manager.clone())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));
    info!(schedule = %args.schedule, "Reconciliation scheduled");

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: args.listen_addr(),
            credentials: BasicCredentials::new(&args.broker_username, &args.broker_password),
            tls_cert_path: args.tls_cert.clone(),
            tls_key_path: args.tls_key.clone(),
        },
        AppState {
            manager,
            defaults: RouteDefaults {
                origin: args.default_origin.trim().to_string(),
                default_ttl: args.default_ttl,
            },
            catalog: CatalogConfig {
                service_id: args.service_id.clone(),
                plan_id: args.plan_id.clone(),
            },
        },
    );

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("API server error: {}", e);
        }
    });

    info!("CDN broker is running, press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    // An in-flight sweep completes before the scheduler exits
    let _ = shutdown_tx.send(true);
    server_handle.abort();
    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task failed: {}", e);
    }
    info!("CDN broker stopped");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
