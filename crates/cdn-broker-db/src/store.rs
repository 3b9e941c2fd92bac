//! Route store: every read and write of the `Route` aggregate goes through here
//!
//! Writes run a pre-save transform that keeps `provisioning_since` in step
//! with `state`, so the inline broker path and the reconciler cannot forget
//! to maintain it. Saves are optimistic: a row is only written if its
//! `lock_version` still matches the version the route was loaded at.

use std::collections::{BTreeSet, HashMap};

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, Condition,
    ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    TransactionTrait,
};
use tracing::debug;

use crate::entities::{certificate, route};
use crate::route::{provisioning_since_after, split_domains};
use crate::{Certificate, Route, RouteState, StoreError};

/// Legacy certificates expiring within this window are due for renewal
const EXPIRY_WINDOW_DAYS: i64 = 30;

/// Example-style filter: every populated field must match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteFilter {
    pub instance_id: Option<String>,
    pub state: Option<RouteState>,
    pub dist_id: Option<String>,
    pub domain_internal: Option<String>,
}

impl RouteFilter {
    pub fn instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            ..Default::default()
        }
    }

    pub fn state(state: RouteState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    fn condition(&self) -> Condition {
        let mut condition = Condition::all();

        if let Some(ref instance_id) = self.instance_id {
            condition = condition.add(route::Column::InstanceId.eq(instance_id.as_str()));
        }
        if let Some(state) = self.state {
            condition = condition.add(route::Column::State.eq(state));
        }
        if let Some(ref dist_id) = self.dist_id {
            condition = condition.add(route::Column::DistId.eq(dist_id.as_str()));
        }
        if let Some(ref domain_internal) = self.domain_internal {
            condition = condition.add(route::Column::DomainInternal.eq(domain_internal.as_str()));
        }

        condition
    }
}

/// Durable persistence for routes and their certificates
#[derive(Clone)]
pub struct RouteStore {
    db: DatabaseConnection,
}

impl RouteStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Insert a new route together with its certificates
    pub async fn create(&self, route: &mut Route) -> Result<(), StoreError> {
        let now = Utc::now();
        let provisioning_since = provisioning_since_after(None, route.state, None, now);

        let txn = self.db.begin().await?;

        let model = route::ActiveModel {
            id: NotSet,
            instance_id: Set(route.instance_id.clone()),
            state: Set(route.state),
            domain_external: Set(route.domain_external.clone()),
            domain_internal: Set(route.domain_internal.clone()),
            dist_id: Set(route.dist_id.clone()),
            origin: Set(route.origin.clone()),
            default_ttl: Set(route.default_ttl),
            forwarded_headers: Set(route.forwarded_headers.join(",")),
            forward_cookies: Set(route.forward_cookies),
            provisioning_since: Set(provisioning_since),
            lock_version: Set(0),
            created_at: NotSet,
            updated_at: NotSet,
        }
        .insert(&txn)
        .await?;

        let certificate_ids = write_certificates(&txn, model.id, &route.certificates).await?;
        txn.commit().await?;

        debug!(instance_id = %route.instance_id, id = model.id, "route created");

        route.id = Some(model.id);
        route.provisioning_since = model.provisioning_since;
        route.lock_version = model.lock_version;
        route.created_at = Some(model.created_at);
        route.updated_at = Some(model.updated_at);
        assign_ids(&mut route.certificates, certificate_ids);

        Ok(())
    }

    /// Write back a loaded route and its certificates atomically
    pub async fn save(&self, route: &mut Route) -> Result<(), StoreError> {
        let id = route
            .id
            .ok_or_else(|| StoreError::NotPersisted(route.instance_id.clone()))?;

        let txn = self.db.begin().await?;

        let stored = route::Entity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound)?;

        if stored.lock_version != route.lock_version {
            return Err(StoreError::Conflict {
                instance_id: route.instance_id.clone(),
                expected: route.lock_version,
            });
        }

        let now = Utc::now();
        let provisioning_since = provisioning_since_after(
            Some(stored.state),
            route.state,
            stored.provisioning_since,
            now,
        );
        let next_version = stored.lock_version + 1;

        let changes = route::ActiveModel {
            id: NotSet,
            instance_id: Set(route.instance_id.clone()),
            state: Set(route.state),
            domain_external: Set(route.domain_external.clone()),
            domain_internal: Set(route.domain_internal.clone()),
            dist_id: Set(route.dist_id.clone()),
            origin: Set(route.origin.clone()),
            default_ttl: Set(route.default_ttl),
            forwarded_headers: Set(route.forwarded_headers.join(",")),
            forward_cookies: Set(route.forward_cookies),
            provisioning_since: Set(provisioning_since),
            lock_version: Set(next_version),
            created_at: NotSet,
            updated_at: Set(now),
        };

        let result = route::Entity::update_many()
            .set(changes)
            .filter(route::Column::Id.eq(id))
            .filter(route::Column::LockVersion.eq(route.lock_version))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::Conflict {
                instance_id: route.instance_id.clone(),
                expected: route.lock_version,
            });
        }

        let certificate_ids = write_certificates(&txn, id, &route.certificates).await?;
        txn.commit().await?;

        debug!(
            instance_id = %route.instance_id,
            state = %route.state,
            version = next_version,
            "route saved"
        );

        route.provisioning_since = provisioning_since;
        route.lock_version = next_version;
        route.updated_at = Some(now);
        assign_ids(&mut route.certificates, certificate_ids);

        Ok(())
    }

    /// First route matching the filter, with certificates loaded
    pub async fn find_one_matching(&self, filter: &RouteFilter) -> Result<Route, StoreError> {
        let model = route::Entity::find()
            .filter(filter.condition())
            .order_by_asc(route::Column::Id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound)?;

        let mut certificates = load_certificates(&self.db, &[model.id]).await?;
        let owned = certificates.remove(&model.id).unwrap_or_default();

        Ok(Route::from_models(model, owned))
    }

    /// All routes matching the filter, with certificates loaded
    pub async fn find_all_matching(&self, filter: &RouteFilter) -> Result<Vec<Route>, StoreError> {
        let models = route::Entity::find()
            .filter(filter.condition())
            .order_by_asc(route::Column::Id)
            .all(&self.db)
            .await?;

        self.with_certificates(models).await
    }

    /// Routes in any of the given states
    pub async fn find_in_states(&self, states: &[RouteState]) -> Result<Vec<Route>, StoreError> {
        let models = route::Entity::find()
            .filter(route::Column::State.is_in(states.iter().copied()))
            .order_by_asc(route::Column::Id)
            .all(&self.db)
            .await?;

        self.with_certificates(models).await
    }

    /// Routes that are not deprovisioned and claim any of the given domains
    pub async fn find_claiming_domains(
        &self,
        domains: &[String],
    ) -> Result<Vec<Route>, StoreError> {
        if domains.is_empty() {
            return Ok(Vec::new());
        }

        let mut condition = Condition::any();
        for domain in domains {
            condition = condition.add(route::Column::DomainExternal.contains(domain.as_str()));
        }

        let models = route::Entity::find()
            .filter(condition)
            .filter(route::Column::State.ne(RouteState::Deprovisioned))
            .order_by_asc(route::Column::Id)
            .all(&self.db)
            .await?;

        // LIKE is a substring match; compare whole domains here
        let models = models
            .into_iter()
            .filter(|model| {
                split_domains(&model.domain_external)
                    .iter()
                    .any(|claimed| domains.contains(claimed))
            })
            .collect();

        self.with_certificates(models).await
    }

    /// Legacy: provisioned routes whose stored certificate expires within 30 days
    pub async fn find_with_expiring_certs(&self) -> Result<Vec<Route>, StoreError> {
        let cutoff = Utc::now() + Duration::days(EXPIRY_WINDOW_DAYS);

        let expiring = certificate::Entity::find()
            .filter(certificate::Column::Expires.is_not_null())
            .filter(certificate::Column::Expires.lt(cutoff))
            .all(&self.db)
            .await?;

        let route_ids: BTreeSet<i32> = expiring.iter().map(|cert| cert.route_id).collect();
        if route_ids.is_empty() {
            return Ok(Vec::new());
        }

        let models = route::Entity::find()
            .filter(route::Column::Id.is_in(route_ids))
            .filter(route::Column::State.eq(RouteState::Provisioned))
            .order_by_asc(route::Column::Id)
            .all(&self.db)
            .await?;

        self.with_certificates(models).await
    }

    async fn with_certificates(&self, models: Vec<route::Model>) -> Result<Vec<Route>, StoreError> {
        let ids: Vec<i32> = models.iter().map(|model| model.id).collect();
        let mut certificates = load_certificates(&self.db, &ids).await?;

        Ok(models
            .into_iter()
            .map(|model| {
                let owned = certificates.remove(&model.id).unwrap_or_default();
                Route::from_models(model, owned)
            })
            .collect())
    }
}

/// Certificates for the given routes, grouped by route and in insertion order
async fn load_certificates<C: ConnectionTrait>(
    conn: &C,
    route_ids: &[i32],
) -> Result<HashMap<i32, Vec<certificate::Model>>, DbErr> {
    let mut grouped: HashMap<i32, Vec<certificate::Model>> = HashMap::new();
    if route_ids.is_empty() {
        return Ok(grouped);
    }

    let rows = certificate::Entity::find()
        .filter(certificate::Column::RouteId.is_in(route_ids.iter().copied()))
        .order_by_asc(certificate::Column::Id)
        .all(conn)
        .await?;

    for row in rows {
        grouped.entry(row.route_id).or_default().push(row);
    }

    Ok(grouped)
}

/// Insert new certificates and update known ones; returns ids in order
async fn write_certificates<C: ConnectionTrait>(
    conn: &C,
    route_id: i32,
    certificates: &[Certificate],
) -> Result<Vec<i32>, DbErr> {
    let mut ids = Vec::with_capacity(certificates.len());

    for cert in certificates {
        let active = certificate::ActiveModel {
            id: cert.id.map(Set).unwrap_or(NotSet),
            route_id: Set(route_id),
            certificate_arn: Set(cert.arn().map(str::to_string)),
            certificate_status: Set(cert.status),
            cert_url: Set(cert.cert_url.clone()),
            certificate: Set(cert.certificate.clone()),
            expires: Set(cert.expires),
            created_at: Set(cert.created_at),
            updated_at: NotSet,
        };

        let model = if cert.id.is_some() {
            active.update(conn).await?
        } else {
            active.insert(conn).await?
        };
        ids.push(model.id);
    }

    Ok(ids)
}

fn assign_ids(certificates: &mut [Certificate], ids: Vec<i32>) {
    for (cert, id) in certificates.iter_mut().zip(ids) {
        cert.id = Some(id);
    }
}
