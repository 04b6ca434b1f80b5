//! Periodic triggering of dispatcher runs.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Once a day at the given local time.
    DailyAt(NaiveTime),
    /// Fixed interval, first run after one interval.
    Every(Duration),
}

impl Schedule {
    /// Time to wait from `now` until the next run.
    pub fn next_delay<Tz: TimeZone>(&self, now: DateTime<Tz>) -> Duration {
        match self {
            Schedule::Every(interval) => *interval,
            Schedule::DailyAt(at) => {
                let tz = now.timezone();
                let mut day = now.date_naive();
                // Skip days where the wall-clock time does not exist (DST gaps).
                for _ in 0..3 {
                    let candidate = tz.from_local_datetime(&day.and_time(*at)).earliest();
                    if let Some(candidate) = candidate.filter(|c| *c > now) {
                        return (candidate - now.clone())
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                    }
                    day += ChronoDuration::days(1);
                }
                Duration::from_secs(24 * 60 * 60)
            }
        }
    }
}

/// Run the dispatcher on `schedule` until `cancel` fires. Runs never overlap:
/// the next delay is computed only after the previous run has finished.
pub async fn run_scheduled(dispatcher: &Dispatcher, schedule: Schedule, cancel: CancellationToken) {
    info!(?schedule, "scheduler started");

    loop {
        let delay = schedule.next_delay(Local::now());
        info!(next_run_in_secs = delay.as_secs(), "waiting for next run");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                match dispatcher.run_once().await {
                    Ok(report) => info!(sent = report.sent, skipped = report.skipped(), "scheduled run complete"),
                    Err(e) => error!(error = %e, "scheduled run failed"),
                }
            }
            _ = cancel.cancelled() => {
                info!("scheduler shutting down");
                break;
            }
        }
    }
}
