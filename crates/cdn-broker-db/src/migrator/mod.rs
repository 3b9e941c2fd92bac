//! Database migrations

use sea_orm_migration::prelude::*;

mod m20261001_000001_init_schema;
mod m20261012_000001_add_route_lock_version;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261001_000001_init_schema::Migration),
            Box::new(m20261012_000001_add_route_lock_version::Migration),
        ]
    }
}
