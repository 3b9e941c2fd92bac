//! Database entities

pub mod certificate;
pub mod route;

pub use certificate::Entity as Certificate;
pub use route::Entity as Route;

pub mod prelude {
    pub use super::certificate::Entity as Certificate;
    pub use super::route::Entity as Route;
}
