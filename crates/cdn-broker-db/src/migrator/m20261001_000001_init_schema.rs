//! Initial schema: routes and the certificates they own

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Create routes table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Routes::Table)
                    .if_not_exists()
                    .col(pk_auto(Routes::Id))
                    .col(string_len(Routes::InstanceId, 255).not_null())
                    .col(
                        string_len(Routes::State, 32)
                            .not_null()
                            .default("provisioning"),
                    )
                    .col(text(Routes::DomainExternal).not_null())
                    .col(string_len(Routes::DomainInternal, 255).not_null().default(""))
                    .col(string_len(Routes::DistId, 255).not_null().default(""))
                    .col(string_len(Routes::Origin, 255).not_null())
                    .col(big_integer(Routes::DefaultTtl).not_null().default(0))
                    .col(text(Routes::ForwardedHeaders).not_null().default(""))
                    .col(boolean(Routes::ForwardCookies).not_null().default(true))
                    .col(timestamp_with_time_zone_null(Routes::ProvisioningSince))
                    .col(
                        timestamp_with_time_zone(Routes::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Routes::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_routes_instance_id")
                    .table(Routes::Table)
                    .col(Routes::InstanceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // The reconciler selects by state on every sweep
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_routes_state")
                    .table(Routes::Table)
                    .col(Routes::State)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Create certificates table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Certificates::Table)
                    .if_not_exists()
                    .col(pk_auto(Certificates::Id))
                    .col(integer(Certificates::RouteId).not_null())
                    .col(text_null(Certificates::CertificateArn))
                    .col(
                        string_len(Certificates::CertificateStatus, 16)
                            .not_null()
                            .default("validating"),
                    )
                    .col(text_null(Certificates::CertUrl))
                    .col(blob_null(Certificates::Certificate))
                    .col(timestamp_with_time_zone_null(Certificates::Expires))
                    .col(
                        timestamp_with_time_zone(Certificates::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Certificates::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_certificates_route_id")
                            .from(Certificates::Table, Certificates::RouteId)
                            .to(Routes::Table, Routes::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_route_id")
                    .table(Certificates::Table)
                    .col(Certificates::RouteId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Certificates::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Routes::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Routes {
    Table,
    Id,
    InstanceId,
    State,
    DomainExternal,
    DomainInternal,
    DistId,
    Origin,
    DefaultTtl,
    ForwardedHeaders,
    ForwardCookies,
    ProvisioningSince,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Certificates {
    Table,
    Id,
    RouteId,
    CertificateArn,
    CertificateStatus,
    CertUrl,
    Certificate,
    Expires,
    CreatedAt,
    UpdatedAt,
}
