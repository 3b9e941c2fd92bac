//! Certificate entity: one issuance attempt owned by a route

use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, ConnectionTrait, DbErr};
use serde::{Deserialize, Serialize};

/// Status of a managed certificate relative to its route
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum CertificateStatus {
    /// Requested, waiting for DNS validation
    #[sea_orm(string_value = "validating")]
    Validating,

    /// Bound to the route's distribution
    #[sea_orm(string_value = "attached")]
    Attached,

    /// Displaced by a newer attached certificate
    #[sea_orm(string_value = "deleted")]
    Deleted,

    #[sea_orm(string_value = "failed")]
    Failed,
}

impl CertificateStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CertificateStatus::Deleted | CertificateStatus::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "certificates")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(indexed)]
    pub route_id: i32,

    /// Identifier returned by the certificate service
    #[sea_orm(column_type = "Text", nullable)]
    pub certificate_arn: Option<String>,

    pub certificate_status: CertificateStatus,

    /// Legacy: ACME certificate URL
    #[sea_orm(column_type = "Text", nullable)]
    pub cert_url: Option<String>,

    /// Legacy: raw certificate bytes
    #[sea_orm(column_type = "Blob", nullable)]
    pub certificate: Option<Vec<u8>>,

    /// Legacy: expiry of an uploaded certificate
    pub expires: Option<ChronoDateTimeUtc>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::route::Entity",
        from = "Column::RouteId",
        to = "super::route::Column::Id",
        on_delete = "Cascade"
    )]
    Route,
}

impl Related<super::route::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Route.def()
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
