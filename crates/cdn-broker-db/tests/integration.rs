//! Integration tests for cdn-broker-db
//!
//! Tests the route store against a real SQLite in-memory database

use chrono::{Duration, Utc};
use cdn_broker_db::entities::{certificate, route};
use cdn_broker_db::{
    connect, migrate, Certificate, CertificateStatus, Route, RouteFilter, RouteState, RouteStore,
    StoreError,
};
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, EntityTrait, IntoActiveModel, PaginatorTrait, Set,
};

/// Helper to create a migrated store
async fn setup_store() -> RouteStore {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    RouteStore::new(db)
}

fn new_route(instance_id: &str, domains: &[&str]) -> Route {
    let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
    let mut route = Route::new(
        instance_id,
        &domains,
        "origin.example.com",
        3600,
        vec!["Host".to_string()],
        true,
    );
    route.dist_id = format!("dist-{}", instance_id);
    route.domain_internal = format!("{}.cloudfront.net", instance_id);
    route
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let result = migrate(&db).await;
    assert!(result.is_ok());

    let backend = db.get_database_backend();
    assert!(matches!(backend, sea_orm::DatabaseBackend::Sqlite));
}

#[tokio::test]
async fn test_create_stamps_provisioning_since() {
    let store = setup_store().await;

    let mut route = new_route("inst-1", &["a.example.com"]);
    route.certificates.push(Certificate::validating("ARN1"));
    store.create(&mut route).await.expect("Failed to create route");

    assert!(route.id.is_some());
    assert!(route.provisioning_since.is_some());
    assert!(route.certificates[0].id.is_some());

    let loaded = store
        .find_one_matching(&RouteFilter::instance("inst-1"))
        .await
        .expect("Route not found");

    assert_eq!(loaded.state, RouteState::Provisioning);
    assert_eq!(loaded.domain_external, "a.example.com");
    assert_eq!(loaded.forwarded_headers, vec!["Host".to_string()]);
    assert_eq!(loaded.certificates.len(), 1);
    assert_eq!(loaded.certificates[0].certificate_arn, "ARN1");
    assert_eq!(loaded.certificates[0].status, CertificateStatus::Validating);
    assert!(loaded.provisioning_since.is_some());
    assert!(loaded.created_at.is_some());
}

#[tokio::test]
async fn test_create_in_stable_state_leaves_provisioning_since_empty() {
    let store = setup_store().await;

    let mut route = new_route("inst-stable", &["a.example.com"]);
    route.state = RouteState::Provisioned;
    store.create(&mut route).await.unwrap();

    assert!(route.provisioning_since.is_none());
}

#[tokio::test]
async fn test_duplicate_instance_id_is_rejected() {
    let store = setup_store().await;

    let mut first = new_route("inst-dup", &["a.example.com"]);
    store.create(&mut first).await.unwrap();

    let mut second = new_route("inst-dup", &["b.example.com"]);
    let result = store.create(&mut second).await;
    assert!(matches!(result, Err(StoreError::Database(_))));
}

#[tokio::test]
async fn test_save_clears_provisioning_since_when_leaving_active_state() {
    let store = setup_store().await;

    let mut route = new_route("inst-2", &["a.example.com"]);
    route.certificates.push(Certificate::validating("ARN1"));
    store.create(&mut route).await.unwrap();

    route.state = RouteState::Provisioned;
    route.certificates[0].status = CertificateStatus::Attached;
    store.save(&mut route).await.expect("Failed to save");

    let loaded = store
        .find_one_matching(&RouteFilter::instance("inst-2"))
        .await
        .unwrap();
    assert_eq!(loaded.state, RouteState::Provisioned);
    assert!(loaded.provisioning_since.is_none());
    assert_eq!(loaded.certificates[0].status, CertificateStatus::Attached);
}

#[tokio::test]
async fn test_save_stamps_provisioning_since_when_entering_active_state() {
    let store = setup_store().await;

    let mut route = new_route("inst-3", &["a.example.com"]);
    route.state = RouteState::Provisioned;
    store.create(&mut route).await.unwrap();
    assert!(route.provisioning_since.is_none());

    route.state = RouteState::Deprovisioning;
    store.save(&mut route).await.unwrap();
    assert!(route.provisioning_since.is_some());

    let loaded = store
        .find_one_matching(&RouteFilter::instance("inst-3"))
        .await
        .unwrap();
    assert!(loaded.provisioning_since.is_some());
}

#[tokio::test]
async fn test_save_keeps_provisioning_since_while_staying_active() {
    let store = setup_store().await;

    let mut route = new_route("inst-4", &["a.example.com"]);
    store.create(&mut route).await.unwrap();

    // Backdate the stamp directly in the table
    let since = Utc::now() - Duration::hours(10);
    let model = route::Entity::find_by_id(route.id.unwrap())
        .one(store.connection())
        .await
        .unwrap()
        .unwrap();
    let mut active = model.into_active_model();
    active.provisioning_since = Set(Some(since));
    active.update(store.connection()).await.unwrap();

    let mut route = store
        .find_one_matching(&RouteFilter::instance("inst-4"))
        .await
        .unwrap();
    route.default_ttl = 60;
    store.save(&mut route).await.unwrap();

    let loaded = store
        .find_one_matching(&RouteFilter::instance("inst-4"))
        .await
        .unwrap();
    assert_eq!(loaded.default_ttl, 60);
    let stored_since = loaded.provisioning_since.unwrap();
    assert!((stored_since - since).num_seconds().abs() < 1);
}

#[tokio::test]
async fn test_stale_save_is_rejected() {
    let store = setup_store().await;

    let mut route = new_route("inst-5", &["a.example.com"]);
    store.create(&mut route).await.unwrap();

    let mut inline_copy = store
        .find_one_matching(&RouteFilter::instance("inst-5"))
        .await
        .unwrap();
    let mut reconciler_copy = inline_copy.clone();

    inline_copy.state = RouteState::Deprovisioning;
    store.save(&mut inline_copy).await.unwrap();

    reconciler_copy.state = RouteState::Provisioned;
    let result = store.save(&mut reconciler_copy).await;
    assert!(matches!(result, Err(StoreError::Conflict { .. })));

    let loaded = store
        .find_one_matching(&RouteFilter::instance("inst-5"))
        .await
        .unwrap();
    assert_eq!(loaded.state, RouteState::Deprovisioning);
}

#[tokio::test]
async fn test_save_unpersisted_route_fails() {
    let store = setup_store().await;

    let mut route = new_route("inst-never", &["a.example.com"]);
    let result = store.save(&mut route).await;
    assert!(matches!(result, Err(StoreError::NotPersisted(_))));
}

#[tokio::test]
async fn test_save_appends_new_certificates() {
    let store = setup_store().await;

    let mut route = new_route("inst-6", &["a.example.com"]);
    route.certificates.push(Certificate::validating("ARN1"));
    store.create(&mut route).await.unwrap();

    route.certificates.push(Certificate::validating("ARN2"));
    store.save(&mut route).await.unwrap();

    let count = certificate::Entity::find()
        .count(store.connection())
        .await
        .unwrap();
    assert_eq!(count, 2);

    let loaded = store
        .find_one_matching(&RouteFilter::instance("inst-6"))
        .await
        .unwrap();
    let arns: Vec<&str> = loaded
        .certificates
        .iter()
        .map(|c| c.certificate_arn.as_str())
        .collect();
    assert_eq!(arns, vec!["ARN1", "ARN2"]);
}

#[tokio::test]
async fn test_find_one_matching_missing_row() {
    let store = setup_store().await;

    let result = store
        .find_one_matching(&RouteFilter::instance("does-not-exist"))
        .await;
    assert!(matches!(result, Err(StoreError::NotFound)));
}

#[tokio::test]
async fn test_find_all_matching_by_state() {
    let store = setup_store().await;

    for (id, state) in [
        ("inst-a", RouteState::Provisioning),
        ("inst-b", RouteState::Provisioned),
        ("inst-c", RouteState::Provisioning),
    ] {
        let mut route = new_route(id, &[&format!("{}.example.com", id)]);
        route.state = state;
        store.create(&mut route).await.unwrap();
    }

    let provisioning = store
        .find_all_matching(&RouteFilter::state(RouteState::Provisioning))
        .await
        .unwrap();
    let ids: Vec<&str> = provisioning.iter().map(|r| r.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["inst-a", "inst-c"]);

    let active = store
        .find_in_states(&RouteState::ACTIVELY_CHANGING)
        .await
        .unwrap();
    assert_eq!(active.len(), 2);
}

#[tokio::test]
async fn test_find_claiming_domains_matches_whole_names() {
    let store = setup_store().await;

    let mut route = new_route("inst-claim", &["www.example.com", "example.com"]);
    store.create(&mut route).await.unwrap();

    let mut gone = new_route("inst-gone", &["old.example.com"]);
    gone.state = RouteState::Deprovisioned;
    store.create(&mut gone).await.unwrap();

    let claims = store
        .find_claiming_domains(&["example.com".to_string()])
        .await
        .unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].instance_id, "inst-claim");

    // substring of a claimed domain is not a claim
    let claims = store
        .find_claiming_domains(&["ample.com".to_string()])
        .await
        .unwrap();
    assert!(claims.is_empty());

    // deprovisioned routes release their domains
    let claims = store
        .find_claiming_domains(&["old.example.com".to_string()])
        .await
        .unwrap();
    assert!(claims.is_empty());
}

#[tokio::test]
async fn test_find_with_expiring_certs() {
    let store = setup_store().await;

    let mut expiring = new_route("inst-expiring", &["a.example.com"]);
    expiring.state = RouteState::Provisioned;
    let mut legacy = Certificate::validating("");
    legacy.status = CertificateStatus::Attached;
    legacy.cert_url = Some("https://acme.example/cert/1".to_string());
    legacy.certificate = Some(b"-----BEGIN CERTIFICATE-----".to_vec());
    legacy.expires = Some(Utc::now() + Duration::days(10));
    expiring.certificates.push(legacy);
    store.create(&mut expiring).await.unwrap();

    let mut healthy = new_route("inst-healthy", &["b.example.com"]);
    healthy.state = RouteState::Provisioned;
    let mut fresh = Certificate::validating("");
    fresh.status = CertificateStatus::Attached;
    fresh.expires = Some(Utc::now() + Duration::days(80));
    healthy.certificates.push(fresh);
    store.create(&mut healthy).await.unwrap();

    let mut managed = new_route("inst-managed", &["c.example.com"]);
    managed.state = RouteState::Provisioned;
    managed.certificates.push(Certificate::validating("ARN-managed"));
    store.create(&mut managed).await.unwrap();

    let routes = store.find_with_expiring_certs().await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].instance_id, "inst-expiring");
}

#[tokio::test]
async fn test_legacy_certificate_fields_survive_rewrite() {
    let store = setup_store().await;

    let mut route = new_route("inst-legacy", &["a.example.com"]);
    route.state = RouteState::Provisioned;
    let mut legacy = Certificate::validating("");
    legacy.status = CertificateStatus::Attached;
    legacy.cert_url = Some("https://acme.example/cert/7".to_string());
    legacy.certificate = Some(vec![1, 2, 3]);
    legacy.expires = Some(Utc::now() + Duration::days(40));
    route.certificates.push(legacy);
    store.create(&mut route).await.unwrap();

    route.state = RouteState::Provisioning;
    route.certificates.push(Certificate::validating("ARN-new"));
    store.save(&mut route).await.unwrap();

    let loaded = store
        .find_one_matching(&RouteFilter::instance("inst-legacy"))
        .await
        .unwrap();
    let old = &loaded.certificates[0];
    assert_eq!(old.arn(), None);
    assert_eq!(old.cert_url.as_deref(), Some("https://acme.example/cert/7"));
    assert_eq!(old.certificate, Some(vec![1, 2, 3]));
    assert!(old.expires.is_some());
    assert_eq!(loaded.certificates[1].arn(), Some("ARN-new"));
}
