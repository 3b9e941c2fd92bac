//! Cron-driven job runner
//!
//! Each tick runs the route sweep and then the orphan sweep. Ticks never
//! overlap: the next fire time is computed only after the previous run ends,
//! so a slow run skips the ticks it overlapped.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::RouteManager;

/// Hourly, on the hour
pub const DEFAULT_SCHEDULE: &str = "0 0 * * * *";

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule {expression:?}: {reason}")]
    Invalid { expression: String, reason: String },
}

pub struct Scheduler {
    schedule: Schedule,
    manager: Arc<RouteManager>,
}

impl Scheduler {
    /// Parse a six-field cron expression (seconds first)
    pub fn new(expression: &str, manager: Arc<RouteManager>) -> Result<Self, ScheduleError> {
        let schedule = parse_schedule(expression)?;
        Ok(Self { schedule, manager })
    }

    pub fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            let Some(next) = self.next_run(now) else {
                warn!("Schedule has no upcoming runs, stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => self.run_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// One tick: route sweep, then orphan sweep
    pub async fn run_once(&self) {
        if let Err(err) = self.manager.check_routes_to_update().await {
            error!(error = %err, "Route sweep failed");
        }
        if let Err(err) = self.manager.delete_orphaned_certs().await {
            error!(error = %err, "Orphan sweep failed");
        }
    }
}

pub fn parse_schedule(expression: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(expression).map_err(|err| ScheduleError::Invalid {
        expression: expression.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_default_schedule_is_hourly() {
        let schedule = parse_schedule(DEFAULT_SCHEDULE).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 10, 15, 30).unwrap();

        let runs: Vec<_> = schedule.after(&start).take(2).collect();
        assert_eq!(runs[0], Utc.with_ymd_and_hms(2026, 10, 19, 11, 0, 0).unwrap());
        assert_eq!(runs[1].hour(), 12);
        assert_eq!(runs[1].minute(), 0);
    }

    /// A scheduler whose adapters panic if a sweep ever runs
    fn idle_scheduler() -> Scheduler {
        let manager = RouteManager::new(
            cdn_broker_db::RouteStore::new(sea_orm::DatabaseConnection::Disconnected),
            Arc::new(cdn_broker_cloud::MockCdnProvider::new()),
            Arc::new(cdn_broker_cloud::MockCertificateProvider::new()),
            crate::ManagerConfig::default(),
        );
        Scheduler::new(DEFAULT_SCHEDULE, Arc::new(manager)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_shutdown_flag_flips() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(idle_scheduler().run(rx));

        // Let the scheduler reach its wait before signalling
        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop on shutdown")
            .expect("no sweep should have run");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_shutdown_sender_drops() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(idle_scheduler().run(rx));

        tokio::task::yield_now().await;
        drop(tx);

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop once the sender is gone")
            .expect("no sweep should have run");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_does_not_start_when_already_shut_down() {
        let (_tx, rx) = watch::channel(true);

        tokio::time::timeout(std::time::Duration::from_secs(5), idle_scheduler().run(rx))
            .await
            .expect("scheduler should return immediately");
    }

    #[test]
    fn test_invalid_schedule_is_rejected() {
        let err = parse_schedule("every hour").unwrap_err();
        assert!(err.to_string().contains("every hour"));
    }
}
