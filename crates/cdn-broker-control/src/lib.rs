//! Control plane for CDN routes
//!
//! [`RouteManager`] drives each route through its lifecycle against the CDN
//! and certificate adapters; [`Scheduler`] runs the periodic sweeps.
pub mod error;
pub mod manager;
pub mod scheduler;

pub use error::RouteManagerError;
pub use manager::{
    is_orphan, CreateRoute, ManagerConfig, OrphanReport, RouteManager, SweepReport, UpdateRoute,
};
pub use scheduler::{parse_schedule, ScheduleError, Scheduler, DEFAULT_SCHEDULE};
