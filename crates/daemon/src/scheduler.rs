use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use image_archiver_core::TriggerSource;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::orchestrator::RunOrchestrator;

pub const DEFAULT_CRON: &str = "0 0 * * * *";

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr).with_context(|| format!("invalid cron expression: {expr}"))
}

/// Time until the schedule next fires after `now`, or `None` if it never fires again.
pub fn next_delay(schedule: &Schedule, now: DateTime<Utc>) -> Option<(DateTime<Utc>, Duration)> {
    let next = schedule.after(&now).next()?;
    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
    Some((next, wait))
}

/// Timer trigger. Fires and forgets like the manual trigger; the run lock settles overlap.
pub async fn scheduler_loop(orchestrator: Arc<RunOrchestrator>, schedule: Schedule) {
    loop {
        let Some((next, wait)) = next_delay(&schedule, Utc::now()) else {
            warn!("schedule has no upcoming times, scheduler stopped");
            return;
        };
        info!(next = %next.format("%Y-%m-%d %H:%M:%S UTC"), "next scheduled backup");
        sleep(wait).await;
        orchestrator.trigger(TriggerSource::Schedule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_hourly() {
        let schedule = parse_schedule(DEFAULT_CRON).unwrap();
        let now = DateTime::parse_from_rfc3339("2026-02-13T01:20:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let (next, wait) = next_delay(&schedule, now).unwrap();
        assert_eq!(next.to_rfc3339(), "2026-02-13T02:00:00+00:00");
        assert_eq!(wait, Duration::from_secs(39 * 60 + 30));
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_schedule("every tuesday").unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }
}
