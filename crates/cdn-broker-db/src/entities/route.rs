//! Route entity: one tenant's CDN instance

use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, ConnectionTrait, DbErr};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a route, stored as a lowercase string
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum RouteState {
    #[sea_orm(string_value = "provisioning")]
    Provisioning,

    #[sea_orm(string_value = "provisioned")]
    Provisioned,

    #[sea_orm(string_value = "deprovisioning")]
    Deprovisioning,

    #[sea_orm(string_value = "deprovisioned")]
    Deprovisioned,

    /// Aliases are claimed by a distribution outside this route
    #[sea_orm(string_value = "conflict")]
    Conflict,

    #[sea_orm(string_value = "failed")]
    Failed,

    /// Certificate validation did not finish within the provisioning window
    #[sea_orm(string_value = "timedout")]
    TimedOut,
}

impl RouteState {
    /// States the reconciliation sweep keeps driving forward
    pub const ACTIVELY_CHANGING: [RouteState; 2] =
        [RouteState::Provisioning, RouteState::Deprovisioning];

    pub fn is_actively_changing(self) -> bool {
        Self::ACTIVELY_CHANGING.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RouteState::Provisioning => "provisioning",
            RouteState::Provisioned => "provisioned",
            RouteState::Deprovisioning => "deprovisioning",
            RouteState::Deprovisioned => "deprovisioned",
            RouteState::Conflict => "conflict",
            RouteState::Failed => "failed",
            RouteState::TimedOut => "timedout",
        }
    }
}

impl std::fmt::Display for RouteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "routes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Service instance GUID handed to us by the platform
    #[sea_orm(unique)]
    pub instance_id: String,

    #[sea_orm(indexed)]
    pub state: RouteState,

    /// Tenant-facing domains, comma joined, first entry is the common name
    #[sea_orm(column_type = "Text")]
    pub domain_external: String,

    /// CDN-assigned hostname (e.g. d111111abcdef8.cloudfront.net)
    pub domain_internal: String,

    pub dist_id: String,

    pub origin: String,

    pub default_ttl: i64,

    /// Comma joined list of headers forwarded to the origin
    #[sea_orm(column_type = "Text")]
    pub forwarded_headers: String,

    pub forward_cookies: bool,

    /// Set while the route is provisioning or deprovisioning
    pub provisioning_since: Option<ChronoDateTimeUtc>,

    /// Bumped on every save, guards against overlapping writers
    #[sea_orm(default_value = 0)]
    pub lock_version: i32,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::certificate::Entity")]
    Certificate,
}

impl Related<super::certificate::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Certificate.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(mut self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let now = chrono::Utc::now();

        if insert && self.created_at.is_not_set() {
            self.created_at = Set(now);
        }
        self.updated_at = Set(now);

        Ok(self)
    }
}
